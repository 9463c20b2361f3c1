//! Allocation and garbage collection for managed language runtimes.
//!
//! A non-moving, precise, generational, stop-the-world mark and sweep
//! collector: small objects are pool-allocated from 16 KiB pages, big
//! objects live on per-thread intrusive lists, immortal data goes to a
//! monotonic permanent arena. Mutator threads carry thread-local
//! allocation state and rendezvous at safepoints; marking inside the stop
//! may be spread over a pool of marker threads balanced by work-stealing
//! deques.
//!
//! The runtime embedding this crate supplies the type layout oracle
//! ([`types::TypeLayout`]) reachable from every object header, walks its
//! own stacks through the [`types::GcFrame`] contract, and receives
//! finalizer and extension callbacks at the documented phases.
//!
//! ```no_run
//! use sable::{instantiate_collector, CollectorOptions};
//! use sable::types::{FieldDesc, TypeLayout};
//!
//! static PAIR: TypeLayout = TypeLayout {
//!     size: 16,
//!     npointers: 2,
//!     name: "pair",
//!     desc: FieldDesc::Ptr8(&[0, 1]),
//!     sweepfunc: None,
//! };
//!
//! let mut mutator = instantiate_collector(CollectorOptions::default());
//! let pair = mutator.alloc(16, &PAIR).unwrap();
//! ```

pub mod alloc;
pub mod callbacks;
pub mod collect;
pub mod deque;
pub mod error;
pub mod finalizers;
pub mod heap;
pub mod mark;
pub mod mark_queue;
pub mod mutator;
pub mod page;
pub mod pages;
pub mod safepoint;
pub mod size_classes;
pub mod stats;
pub mod sweep;
pub mod types;
pub mod utils;
pub mod value;

#[cfg(test)]
mod tests;

pub use collect::{
    default_collect_interval, instantiate_collector, CollectionKind, Collector, CollectorOptions,
};
pub use error::GcError;
pub use mark::Marker;
pub use mutator::{GcState, JoinData, Mutator, MutatorRef};
pub use size_classes::GC_MAX_SZCLASS;
pub use stats::GcNum;
pub use value::{TaggedValue, Value, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED, PROMOTE_AGE};
