//! Per-mutator heap state: the size-class pools, the big object list, and
//! the bookkeeping lists the collector walks during a cycle. Every field is
//! single-writer: only the owning mutator (or the collector while that
//! mutator is parked) touches it.

use std::ptr::null_mut;

use crate::size_classes::{N_POOLS, SIZE_CLASSES};
use crate::types::Binding;
use crate::value::{BigVal, TaggedValue, Value};

/// Allocator state for one `(thread, size class)` pair.
pub struct Pool {
    /// Stack of free cells, threaded through the header word. All cells on
    /// it belong to pages of this pool but may span several pages.
    pub freelist: *mut TaggedValue,
    /// Bump cursor into the current fresh page; the first word of a page
    /// threads the chain of further empty pages.
    pub newpages: *mut TaggedValue,
    pub osize: u32,
}

/// Tracking node for an array whose buffer came from `managed_malloc`.
/// Nodes are recycled through `ThreadHeap::mafreelist`.
pub struct MallocArray {
    pub a: *mut Value,
    pub next: *mut MallocArray,
}

pub struct ThreadHeap {
    pub pools: [Pool; N_POOLS],
    /// Weak references allocated by this mutator.
    pub weak_refs: Vec<*mut Value>,
    /// Arrays with malloc'd storage.
    pub mallocarrays: *mut MallocArray,
    pub mafreelist: *mut MallocArray,
    /// Live big objects owned by this mutator.
    pub big_objects: *mut BigVal,
    /// Old objects that may reference young ones, recorded by the write
    /// barrier. Rotated with `last_remset` at the start of each cycle.
    pub remset: Vec<*mut Value>,
    pub last_remset: Vec<*mut Value>,
    pub rem_bindings: Vec<*mut Binding>,
    /// Conservative count of intergenerational pointer slots.
    pub remset_nptr: usize,
}

impl ThreadHeap {
    pub fn new() -> Self {
        let mut pools: [Pool; N_POOLS] = std::array::from_fn(|_| Pool {
            freelist: null_mut(),
            newpages: null_mut(),
            osize: 0,
        });
        for (i, p) in pools.iter_mut().enumerate() {
            p.osize = SIZE_CLASSES[i] as u32;
        }
        Self {
            pools,
            weak_refs: Vec::new(),
            mallocarrays: null_mut(),
            mafreelist: null_mut(),
            big_objects: null_mut(),
            remset: Vec::new(),
            last_remset: Vec::new(),
            rem_bindings: Vec::new(),
            remset_nptr: 0,
        }
    }
}

/// Number of big-object transitions batched before a flush under the cache
/// lock.
pub const MARK_CACHE_BIG: usize = 1024;

/// Per-marker cache of mark-phase side effects, flushed under
/// `gc_cache_lock` so the hot marking loop stays lock free.
pub struct MarkCache {
    /// Big object headers to relink; the low pointer bit records whether
    /// the object goes back to the young list.
    pub big_obj: [*mut (); MARK_CACHE_BIG],
    pub nbig_obj: usize,
    /// Young bytes scanned.
    pub scanned_bytes: isize,
    /// Old bytes scanned.
    pub perm_scanned_bytes: isize,
}

impl MarkCache {
    pub fn new() -> Self {
        Self {
            big_obj: [null_mut(); MARK_CACHE_BIG],
            nbig_obj: 0,
            scanned_bytes: 0,
            perm_scanned_bytes: 0,
        }
    }
}
