use thiserror::Error;

/// Errors surfaced at allocation call sites. Neither is retried by the
/// collector itself.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    #[error("garbage collector ran out of memory")]
    OutOfMemory,
    #[error("allocation size overflowed when adding the object header")]
    SizeOverflow,
}
