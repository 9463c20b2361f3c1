//! Collection counters, exposed through `Collector::num()`.

use std::sync::atomic::{AtomicI64, AtomicU64};

/// Global counter block. `interval` is the current allocation budget
/// between automatic collections; the `total_*` fields accumulate across
/// the whole process lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcNum {
    pub allocd: i64,
    pub deferred_alloc: i64,
    pub freed: i64,
    pub malloc: u64,
    pub realloc: u64,
    pub poolalloc: u64,
    pub bigalloc: u64,
    pub freecall: u64,
    pub total_time: u64,
    pub total_allocd: u64,
    pub since_sweep: u64,
    pub interval: usize,
    pub pause: u64,
    pub full_sweep: u64,
    pub max_pause: u64,
    pub max_memory: u64,
    pub time_to_safepoint: u64,
    pub max_time_to_safepoint: u64,
    pub sweep_time: u64,
    pub mark_time: u64,
    pub total_sweep_time: u64,
    pub total_mark_time: u64,
}

/// Per-mutator counters, updated with relaxed stores on the allocation
/// paths and folded into the global block at the start of each cycle.
/// `allocd` starts at `-interval` so crossing zero is the collection
/// trigger.
pub struct ThreadGcNum {
    pub allocd: AtomicI64,
    pub freed: AtomicI64,
    pub malloc: AtomicU64,
    pub realloc: AtomicU64,
    pub poolalloc: AtomicU64,
    pub bigalloc: AtomicU64,
    pub freecall: AtomicU64,
}

impl ThreadGcNum {
    pub fn new() -> Self {
        Self {
            allocd: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            malloc: AtomicU64::new(0),
            realloc: AtomicU64::new(0),
            poolalloc: AtomicU64::new(0),
            bigalloc: AtomicU64::new(0),
            freecall: AtomicU64::new(0),
        }
    }
}
