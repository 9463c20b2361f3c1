//! The collector itself: global state, the stop-the-world control loop,
//! quick/full sweep heuristics and the public control API.

use std::cell::{Cell, UnsafeCell};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use atomic::Ordering as AOrdering;
use parking_lot::{lock_api::RawMutex, RawMutex as Lock};

use crate::callbacks::Callbacks;
use crate::finalizers::{run_finalizers, sweep_finalizer_list, FinList};
use crate::mark::{
    gc_mark_loop_parallel, gc_mark_roots, gc_premark, gc_queue_bt_buf, gc_queue_remset,
    gc_queue_thread_local, Marker,
};
use crate::mutator::{GcState, JoinData, Mutator, MutatorRef};
use crate::pages::PageAlloc;
use crate::safepoint::GlobalSafepoint;
use crate::size_classes::GC_MAX_SZCLASS;
use crate::stats::GcNum;
use crate::sweep::{
    gc_clear_weak_refs, gc_internal_obj_base_ptr, gc_sweep_big, gc_sweep_foreign_objs,
    gc_sweep_malloced_arrays, gc_sweep_perm_alloc, gc_sweep_pool, gc_sweep_weak_refs,
};
use crate::utils::formatted_size;
use crate::value::{as_tagged, BigVal, TaggedValue, Value, GC_MARKED, GC_OLD_MARKED, WORD};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionKind {
    /// Heuristic-driven collection; usually a quick sweep.
    Auto,
    /// Forced full sweep, followed by one automatic re-collection.
    Full,
}

/// Initial allocation budget between automatic collections.
#[cfg(target_pointer_width = "64")]
pub const fn default_collect_interval() -> usize {
    5600 * 1024 * WORD
}
#[cfg(target_pointer_width = "32")]
pub const fn default_collect_interval() -> usize {
    3200 * 1024 * WORD
}

#[cfg(target_pointer_width = "64")]
const DEFAULT_MAX_COLLECT_INTERVAL: usize = 1_250_000_000;
#[cfg(target_pointer_width = "32")]
const DEFAULT_MAX_COLLECT_INTERVAL: usize = 500_000_000;

/// `max_total_memory` is a suggestion. We try very hard to stay under this
/// limit, but we will go above it rather than halting.
#[cfg(target_pointer_width = "64")]
const DEFAULT_MAX_TOTAL_MEMORY: usize = 2 * 1024 * 1024 * 1024 * 1024 * 1024;
#[cfg(target_pointer_width = "32")]
const DEFAULT_MAX_TOTAL_MEMORY: usize = 2 * 1024 * 1024 * 1024;

pub struct CollectorOptions {
    pub verbose: bool,
    /// Marker threads used to drain the mark queue; 1 keeps marking on the
    /// collecting thread.
    pub marker_threads: usize,
    /// Debug knob: make every sweep a full sweep.
    pub always_full: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            marker_threads: 1,
            always_full: false,
        }
    }
}

/// Process-wide collector state. Every global of the design lives here and
/// carries its own synchronization contract: the three page pools and the
/// perm arena behind their mutexes, the mark-cache flush behind
/// `gc_cache_lock`, the finalizer lists behind `finalizers_lock` plus the
/// acquire/release length protocol, and everything else single-writer by
/// the thread that won the collection slot.
pub struct Collector {
    pub(crate) safepoint: GlobalSafepoint,
    /// Guards the mutator list; held for the entire stop so threads cannot
    /// attach or detach mid-collection.
    pub(crate) global_lock: Lock,
    pub(crate) mutators: Vec<*mut Mutator>,
    pub(crate) page_alloc: PageAlloc,

    pub(crate) gc_cache_lock: Lock,
    pub(crate) finalizers_lock: Lock,
    pub(crate) gc_perm_lock: Lock,
    pub(crate) gc_perm_pool: Cell<usize>,
    pub(crate) gc_perm_end: Cell<usize>,
    pub(crate) perm_region: (usize, usize),
    pub(crate) perm_marked: UnsafeCell<Vec<usize>>,

    /// Marked big objects parked away from the per-thread lists; merged
    /// back on the next full sweep. Collector-thread only.
    pub(crate) big_objects_marked: UnsafeCell<*mut BigVal>,

    pub(crate) finalizer_list_marked: FinList,
    pub(crate) to_finalize: FinList,
    pub(crate) have_pending_finalizers: AtomicBool,
    /// Runtime hook that applies a managed finalizer callback to its
    /// object.
    pub(crate) finalizer_dispatch: Option<unsafe fn(*mut Value, *mut Value)>,
    /// External hook that reclaims inactive task stacks during sweep.
    pub(crate) sweep_stack_pools_hook: Option<fn()>,

    /// Extension callback lists; see [`crate::callbacks`].
    pub callbacks: Callbacks,
    pub(crate) global_roots: Vec<*mut *mut Value>,

    pub(crate) gc_num: GcNum,
    pub(crate) deferred_alloc: AtomicI64,
    pub(crate) live_bytes: AtomicI64,
    pub(crate) last_live_bytes: i64,
    pub(crate) promoted_bytes: i64,
    pub(crate) scanned_bytes: AtomicI64,
    pub(crate) perm_scanned_bytes: AtomicI64,
    pub(crate) last_gc_total_bytes: Cell<i64>,
    pub(crate) prev_sweep_full: bool,
    pub(crate) lazy_freed_pages: i64,

    pub(crate) disable_counter: AtomicU32,
    pub(crate) max_total_memory: AtomicUsize,
    pub(crate) max_collect_interval: usize,
    /// Marking treats claimed objects as freshly allocated; only active
    /// while the `to_finalize` list is re-marked, and never when
    /// conservative scanning needs stable age bits.
    pub(crate) mark_reset_age: Cell<bool>,
    pub(crate) support_conservative: AtomicBool,
    pub(crate) always_full: bool,
    pub(crate) verbose: bool,

    marker_pool: Option<scoped_threadpool::Pool>,

    pub(crate) undef: *mut Value,
    pub(crate) last_trim_maxrss: i64,
    pub(crate) t_start: Instant,
    total_gcs: usize,
}

unsafe impl Send for Collector {}
unsafe impl Sync for Collector {}

/// Create a collector and its first mutator.
pub fn instantiate_collector(options: CollectorOptions) -> MutatorRef {
    let collector = Arc::new(UnsafeCell::new(Collector::new(options)));
    let href = unsafe { &mut *collector.get() };
    let join_data = JoinData::new();
    let mut mutator = MutatorRef::new(Mutator::new(
        collector.clone(),
        href.gc_num.interval,
        join_data.internal.clone(),
    ));
    href.attach_mutator(&mut *mutator);
    mutator.state_set(GcState::Running, GcState::Safe);
    mutator
}

impl Collector {
    fn new(options: CollectorOptions) -> Self {
        let mut gc_num = GcNum::default();
        gc_num.interval = default_collect_interval();

        // on a big memory machine, spread automatic collections out up to
        // totalmem / ncores / 2
        let mut max_collect_interval = DEFAULT_MAX_COLLECT_INTERVAL;
        let total_mem = os_total_memory();
        if total_mem != 0 {
            let maxmem = total_mem / num_cpus::get() / 2;
            if maxmem > max_collect_interval {
                max_collect_interval = maxmem;
            }
        }

        // we allocate with abandon until we get close to the free memory on
        // the machine; 70% high water mark
        let mut max_total_memory = DEFAULT_MAX_TOTAL_MEMORY;
        let free_mem = os_free_memory();
        if free_mem != 0 {
            let high_water_mark = free_mem / 10 * 7;
            if high_water_mark < max_total_memory {
                max_total_memory = high_water_mark;
            }
        }

        let marker_pool = if options.marker_threads > 1 {
            Some(scoped_threadpool::Pool::new(options.marker_threads as u32))
        } else {
            None
        };

        let mut this = Self {
            safepoint: GlobalSafepoint::new(),
            global_lock: Lock::INIT,
            mutators: Vec::new(),
            page_alloc: PageAlloc::new(),
            gc_cache_lock: Lock::INIT,
            finalizers_lock: Lock::INIT,
            gc_perm_lock: Lock::INIT,
            gc_perm_pool: Cell::new(0),
            gc_perm_end: Cell::new(0),
            perm_region: (0, 0),
            perm_marked: UnsafeCell::new(Vec::new()),
            big_objects_marked: UnsafeCell::new(null_mut()),
            finalizer_list_marked: FinList::new(),
            to_finalize: FinList::new(),
            have_pending_finalizers: AtomicBool::new(false),
            finalizer_dispatch: None,
            sweep_stack_pools_hook: None,
            callbacks: Callbacks::new(),
            global_roots: Vec::new(),
            gc_num,
            deferred_alloc: AtomicI64::new(0),
            live_bytes: AtomicI64::new(0),
            last_live_bytes: 0,
            promoted_bytes: 0,
            scanned_bytes: AtomicI64::new(0),
            perm_scanned_bytes: AtomicI64::new(0),
            last_gc_total_bytes: Cell::new(0),
            prev_sweep_full: false,
            lazy_freed_pages: 0,
            disable_counter: AtomicU32::new(0),
            max_total_memory: AtomicUsize::new(max_total_memory),
            max_collect_interval,
            mark_reset_age: Cell::new(false),
            support_conservative: AtomicBool::new(false),
            always_full: options.always_full,
            verbose: options.verbose,
            marker_pool,
            undef: null_mut(),
            last_trim_maxrss: 0,
            t_start: Instant::now(),
            total_gcs: 0,
        };

        // the canonical sentinel cleared weak references point at; immortal
        // and permanently old
        let tag = this
            .perm_alloc(2 * WORD, true, crate::value::HEAP_ALIGNMENT, WORD)
            .expect("collector bootstrap allocation failed");
        unsafe {
            let tag = tag.cast::<TaggedValue>();
            (*tag).set_header(&crate::types::UNDEF_LAYOUT as *const _ as usize | GC_OLD_MARKED);
            this.undef = crate::value::value_of(tag);
        }
        this
    }

    /// The canonical undef sentinel.
    #[inline]
    pub fn undef(&self) -> *mut Value {
        self.undef
    }

    pub(crate) fn attach_mutator(&mut self, mutator: *mut Mutator) {
        self.global_lock.lock();
        unsafe {
            (*mutator).tid = self.mutators.len() as u16;
        }
        self.mutators.push(mutator);
        self.safepoint.mutator_attached();
        unsafe {
            self.global_lock.unlock();
        }
    }

    /// Mark a mutator dead. Its slot is kept: pages and big objects it
    /// allocated still carry its thread id and keep getting swept.
    pub(crate) fn detach_mutator(&mut self, mutator: *mut Mutator) {
        self.global_lock.lock();
        unsafe {
            (*mutator).dead.set(true);
            (*mutator).gcstack.set(null_mut());
            (*mutator).current_task.set(null_mut());
            (*mutator).root_task.set(null_mut());
            (*mutator).next_task.set(null_mut());
            (*mutator).previous_task.set(null_mut());
            (*mutator).previous_exception.set(null_mut());
            (*mutator).bt_buf.clear();
        }
        self.safepoint.mutator_detached();
        unsafe {
            self.global_lock.unlock();
        }
    }

    pub(crate) fn is_root_task(&self, v: *mut Value) -> bool {
        self.mutators
            .iter()
            .any(|&m| unsafe { (*m).root_task.get() == v })
    }

    /// Register a global root slot; the value it holds at each collection
    /// is treated as a root.
    pub fn add_global_root(&mut self, slot: *mut *mut Value) {
        self.global_lock.lock();
        self.global_roots.push(slot);
        unsafe {
            self.global_lock.unlock();
        }
    }

    pub fn set_finalizer_dispatch(&mut self, dispatch: unsafe fn(*mut Value, *mut Value)) {
        self.finalizer_dispatch = Some(dispatch);
    }

    pub fn set_stack_sweep_hook(&mut self, hook: fn()) {
        self.sweep_stack_pools_hook = Some(hook);
    }

    fn combine_thread_counts(&mut self) {
        let interval = self.gc_num.interval;
        for &m in self.mutators.iter() {
            let m = unsafe { &*m };
            self.gc_num.allocd +=
                m.gc_num.allocd.load(Ordering::Relaxed) + interval as i64;
            self.gc_num.freed += m.gc_num.freed.load(Ordering::Relaxed);
            self.gc_num.malloc += m.gc_num.malloc.load(Ordering::Relaxed);
            self.gc_num.realloc += m.gc_num.realloc.load(Ordering::Relaxed);
            self.gc_num.poolalloc += m.gc_num.poolalloc.load(Ordering::Relaxed);
            self.gc_num.bigalloc += m.gc_num.bigalloc.load(Ordering::Relaxed);
            self.gc_num.freecall += m.gc_num.freecall.load(Ordering::Relaxed);
        }
        self.gc_num.allocd += self.deferred_alloc.swap(0, Ordering::Relaxed);
    }

    fn reset_thread_counts(&self) {
        let interval = self.gc_num.interval;
        for &m in self.mutators.iter() {
            let m = unsafe { &*m };
            m.gc_num.allocd.store(-(interval as i64), Ordering::Relaxed);
            m.gc_num.freed.store(0, Ordering::Relaxed);
            m.gc_num.malloc.store(0, Ordering::Relaxed);
            m.gc_num.realloc.store(0, Ordering::Relaxed);
            m.gc_num.poolalloc.store(0, Ordering::Relaxed);
            m.gc_num.bigalloc.store(0, Ordering::Relaxed);
            m.gc_num.freecall.store(0, Ordering::Relaxed);
        }
    }

    /// Collection entry point. Any mutator may call; exactly one wins the
    /// collection slot, the rest park until it finishes.
    pub fn collect(&mut self, mutator: &mut Mutator, collection: CollectionKind) {
        if self.disable_counter.load(Ordering::Relaxed) != 0 {
            // defer the accounting so re-enabling can trigger promptly
            let interval = self.gc_num.interval as i64;
            let localbytes = mutator.gc_num.allocd.load(Ordering::Relaxed) + interval;
            mutator.gc_num.allocd.store(-interval, Ordering::Relaxed);
            self.deferred_alloc.fetch_add(localbytes, Ordering::Relaxed);
            return;
        }

        let old_state = mutator.state.load(AOrdering::Relaxed);
        mutator.state.store(GcState::Waiting, AOrdering::Release);
        let t0 = Instant::now();
        if !self.safepoint.start_gc() {
            // multi-thread only: somebody else won and already collected
            mutator.state_set(old_state, GcState::Waiting);
            return;
        }

        // the world belongs to us now; hold the mutator-list lock for the
        // whole stop so attach/detach cannot race the collection
        self.global_lock.lock();
        unsafe {
            self.safepoint.wait_for_the_world(&self.mutators);
        }

        let duration = t0.elapsed().as_nanos() as u64;
        if duration > self.gc_num.max_time_to_safepoint {
            self.gc_num.max_time_to_safepoint = duration;
        }
        self.gc_num.time_to_safepoint = duration;

        self.callbacks
            .pre_gc
            .invoke(|cb| cb(collection == CollectionKind::Full));

        if self.disable_counter.load(Ordering::Relaxed) == 0 {
            self.finalizers_lock.lock();
            unsafe {
                if self._collect(mutator, collection) {
                    let recollect = self._collect(mutator, CollectionKind::Auto);
                    debug_assert!(!recollect);
                }
                self.finalizers_lock.unlock();
            }
        }

        unsafe {
            self.global_lock.unlock();
        }
        self.safepoint.end_gc();
        mutator.state_set(old_state, GcState::Waiting);

        // hint the kernel about the freed pages, outside the pause
        self.page_alloc.madvise_idle_pages();

        // only disable finalizers on the current thread; waiting for
        // finalizers on other threads cannot be done without deadlocks
        if mutator.finalizers_inhibited.get() == 0 && !mutator.in_finalizer.get() {
            mutator.in_finalizer.set(true);
            run_finalizers(mutator);
            mutator.in_finalizer.set(false);
        }

        self.callbacks
            .post_gc
            .invoke(|cb| cb(collection == CollectionKind::Full));
    }

    /// The collection proper; runs with the world stopped and the
    /// finalizers lock held. Returns whether a re-collection is required.
    unsafe fn _collect(&mut self, mutator: &mut Mutator, collection: CollectionKind) -> bool {
        self.combine_thread_counts();

        let gc_start = Instant::now();
        let last_perm_scanned_bytes = self.perm_scanned_bytes.load(Ordering::Relaxed);
        let pool_ptr = self
            .marker_pool
            .as_mut()
            .map(|p| p as *mut scoped_threadpool::Pool);

        // ------------------------------------------------------ mark
        {
            let cself: &Collector = &*(self as *const Collector);
            let mut marker = Marker::new(cself, mutator as *mut Mutator);

            // fix the GC bits of everything in the remsets
            for &m in cself.mutators.iter() {
                gc_premark(m);
            }
            for &m in cself.mutators.iter() {
                // thread local roots, backtrace buffers, then everything in
                // the last remsets and remembered bindings
                gc_queue_thread_local(&mut marker, m);
                gc_queue_bt_buf(&mut marker, m);
                gc_queue_remset(&mut marker, m);
            }
            gc_mark_roots(&mut marker);
            if !cself.callbacks.root_scanner.is_empty() {
                let mk: *mut Marker = &mut marker;
                cself
                    .callbacks
                    .root_scanner
                    .invoke(|cb| cb(unsafe { &mut *mk }, collection == CollectionKind::Full));
            }
            match pool_ptr {
                Some(pool) => {
                    let mut queue = marker.take_queue();
                    gc_mark_loop_parallel(cself, mutator as *mut Mutator, &mut queue, &mut *pool);
                }
                None => marker.mark_loop(),
            }

            // clear the weak refs before finalizer discovery resurrects
            // anything
            gc_clear_weak_refs(cself);

            // check for objects to finalize. Record the marked-list length
            // first since discovery appends to it and the new entries must
            // be re-marked below.
            let mut orig_marked_len = cself.finalizer_list_marked.len();
            for &m in cself.mutators.iter() {
                sweep_finalizer_list(cself, &(*m).finalizers as *const FinList as *mut FinList);
            }
            if cself.prev_sweep_full {
                sweep_finalizer_list(
                    cself,
                    &cself.finalizer_list_marked as *const FinList as *mut FinList,
                );
                orig_marked_len = 0;
            }
            for &m in cself.mutators.iter() {
                marker.mark_finlist(&(*m).finalizers, 0);
            }
            marker.mark_finlist(&cself.finalizer_list_marked, orig_marked_len);
            // entries ready to run are re-marked as if freshly allocated:
            // they stay live exactly until their callback has run. Skipped
            // when conservative support needs the age bits intact.
            cself
                .mark_reset_age
                .set(!cself.support_conservative.load(Ordering::Relaxed));
            marker.mark_finlist(&cself.to_finalize, 0);
            marker.mark_loop();
            cself.mark_reset_age.set(false);

            marker.sync_cache();
            marker.flush_remset();
        }

        let mark_time = gc_start.elapsed().as_nanos() as u64;
        self.gc_num.mark_time = mark_time;
        self.gc_num.total_mark_time += mark_time;
        self.gc_num.since_sweep += self.gc_num.allocd.max(0) as u64;
        let actual_allocd = self.gc_num.since_sweep as i64;

        let scanned_bytes = self.scanned_bytes.load(Ordering::Relaxed);
        let perm_scanned_bytes = self.perm_scanned_bytes.load(Ordering::Relaxed);
        let live_bytes = self.live_bytes.load(Ordering::Relaxed);

        self.gc_num.total_allocd += self.gc_num.since_sweep;
        if !self.prev_sweep_full {
            self.promoted_bytes += perm_scanned_bytes - last_perm_scanned_bytes;
        }

        // ----------------------------------------- next collection decision
        let live_sz_ub = live_bytes + actual_allocd;
        let live_sz_est = scanned_bytes + perm_scanned_bytes;
        let estimate_freed = live_sz_ub - live_sz_est;

        let not_freed_enough =
            collection == CollectionKind::Auto && estimate_freed < 7 * (actual_allocd / 10);
        let mut nptr = 0;
        for &m in self.mutators.iter() {
            nptr += (*m).heap.remset_nptr;
        }
        // many pointers in the intergenerational frontier => "quick" sweep
        // is not quick
        let large_frontier = nptr * WORD >= default_collect_interval();
        let mut sweep_full = false;
        let mut recollect = false;

        if collection == CollectionKind::Auto {
            if not_freed_enough {
                self.gc_num.interval *= 2;
            }
            if large_frontier {
                sweep_full = true;
            }
            if self.gc_num.interval > self.max_collect_interval {
                sweep_full = true;
                self.gc_num.interval = self.max_collect_interval;
            }
        }
        // if the live data outgrows the suggested max_total_memory we keep
        // going with minimum intervals and full sweeps until we either free
        // some space or get an OOM error
        if live_bytes > self.max_total_memory.load(Ordering::Relaxed) as i64 {
            sweep_full = true;
        }
        if self.always_full {
            sweep_full = true;
        }
        if collection == CollectionKind::Full {
            sweep_full = true;
            recollect = true;
        }
        if sweep_full {
            // these are the difference between the number of gc-perm bytes
            // scanned on the first collection after sweep_full, and the
            // current scan
            self.perm_scanned_bytes.store(0, Ordering::Relaxed);
            self.promoted_bytes = 0;
        }
        self.scanned_bytes.store(0, Ordering::Relaxed);

        // ------------------------------------------------------ sweep
        let sweep_start = Instant::now();
        gc_sweep_weak_refs(self);
        if let Some(hook) = self.sweep_stack_pools_hook {
            hook();
        }
        gc_sweep_foreign_objs(self);
        gc_sweep_malloced_arrays(self);
        gc_sweep_big(self, mutator as *mut Mutator, sweep_full);
        gc_sweep_pool(self, sweep_full);
        if sweep_full {
            gc_sweep_perm_alloc(self);
        }

        let sweep_time = sweep_start.elapsed().as_nanos() as u64;
        let pause = gc_start.elapsed().as_nanos() as u64;
        self.gc_num.sweep_time = sweep_time;
        self.gc_num.total_sweep_time += sweep_time;

        // if it was a quick sweep, put the remembered objects back in the
        // queued state so the write barrier does not fire on them again
        for &m in self.mutators.iter() {
            let heap = &mut (*m).heap;
            if !sweep_full {
                for &item in heap.remset.iter() {
                    (*as_tagged(item)).set_bits(GC_MARKED);
                }
                for &b in heap.rem_bindings.iter() {
                    (*as_tagged(b.cast())).set_bits(GC_MARKED);
                }
            } else {
                heap.remset.clear();
                heap.rem_bindings.clear();
                heap.remset_nptr = 0;
            }
        }

        #[cfg(target_os = "linux")]
        if sweep_full {
            // empirically, the malloc runaway occurs within a growth gap of
            // about 20-25%
            let rss = os_maxrss();
            if rss > (self.last_trim_maxrss / 4) * 5 {
                libc::malloc_trim(0);
                self.last_trim_maxrss = rss;
            }
        }

        self.gc_num.full_sweep += sweep_full as u64;

        let max_memory = self.last_live_bytes + self.gc_num.allocd;
        if max_memory as u64 > self.gc_num.max_memory {
            self.gc_num.max_memory = max_memory as u64;
        }

        self.gc_num.allocd = 0;
        self.last_live_bytes = live_bytes;
        let live_bytes = live_bytes + self.gc_num.since_sweep as i64 - self.gc_num.freed;
        self.live_bytes.store(live_bytes, Ordering::Relaxed);

        if collection == CollectionKind::Auto {
            // if the current interval is larger than half the live data,
            // decrease it, but never below the default
            let half = (live_bytes.max(0) / 2) as usize;
            if self.gc_num.interval > half {
                self.gc_num.interval = half;
            }
            if self.gc_num.interval < default_collect_interval() {
                self.gc_num.interval = default_collect_interval();
            }
        }
        let max_total = self.max_total_memory.load(Ordering::Relaxed) as i64;
        if self.gc_num.interval as i64 + live_bytes > max_total {
            if live_bytes < max_total {
                self.gc_num.interval = (max_total - live_bytes) as usize;
            } else {
                // we can't stay under our goal so let's go back to the
                // minimum interval and hope things get better
                self.gc_num.interval = default_collect_interval();
            }
        }

        if self.verbose {
            eprintln!(
                "[gc] GC({}) {} sweep ({:?}) freed {} live {} interval {} {:.4}ms",
                self.total_gcs,
                if sweep_full { "full" } else { "quick" },
                collection,
                formatted_size(self.gc_num.freed.max(0) as usize),
                formatted_size(live_bytes.max(0) as usize),
                formatted_size(self.gc_num.interval),
                pause as f64 / 1_000_000.0
            );
        }
        self.total_gcs += 1;

        self.prev_sweep_full = sweep_full;
        if !recollect {
            self.gc_num.pause += 1;
        }
        self.gc_num.total_time += pause;
        self.gc_num.since_sweep = 0;
        self.gc_num.freed = 0;
        if pause > self.gc_num.max_pause {
            self.gc_num.max_pause = pause;
        }
        self.reset_thread_counts();

        recollect
    }

    // ------------------------------------------------------ control API

    /// Per-mutator enable/disable, nested through a process-wide counter.
    /// Returns the previous state. Disabling does not cancel an in-flight
    /// cycle; it only defers triggering new ones.
    pub fn enable(&self, mutator: &Mutator, on: bool) -> bool {
        let prev = !mutator.disable_gc.get();
        mutator.disable_gc.set(!on);
        if on && !prev {
            // disable -> enable
            self.disable_counter.fetch_sub(1, Ordering::AcqRel);
        } else if prev && !on {
            // enable -> disable; wait for an in-flight collection first
            self.disable_counter.fetch_add(1, Ordering::AcqRel);
            mutator.safepoint();
        }
        prev
    }

    pub fn is_enabled(&self, mutator: &Mutator) -> bool {
        !mutator.disable_gc.get()
    }

    pub fn set_max_memory(&self, max_mem: usize) {
        if max_mem > 0 {
            self.max_total_memory.store(max_mem, Ordering::Relaxed);
        }
    }

    /// Toggle the per-cycle report lines on stderr.
    pub fn enable_logging(&mut self, on: bool) {
        self.verbose = on;
    }

    pub fn live_bytes(&self) -> i64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Counter snapshot with the per-thread counters folded in.
    pub fn num(&self) -> GcNum {
        let mut num = self.gc_num;
        let interval = self.gc_num.interval;
        for &m in self.mutators.iter() {
            let m = unsafe { &*m };
            num.allocd += m.gc_num.allocd.load(Ordering::Relaxed) + interval as i64;
            num.freed += m.gc_num.freed.load(Ordering::Relaxed);
            num.malloc += m.gc_num.malloc.load(Ordering::Relaxed);
            num.realloc += m.gc_num.realloc.load(Ordering::Relaxed);
            num.poolalloc += m.gc_num.poolalloc.load(Ordering::Relaxed);
            num.bigalloc += m.gc_num.bigalloc.load(Ordering::Relaxed);
            num.freecall += m.gc_num.freecall.load(Ordering::Relaxed);
        }
        num.deferred_alloc = self.deferred_alloc.load(Ordering::Relaxed);
        num
    }

    pub fn reset_stats(&mut self) {
        self.gc_num.max_pause = 0;
        self.gc_num.max_memory = 0;
        self.gc_num.max_time_to_safepoint = 0;
    }

    /// Total bytes allocated over the process lifetime.
    pub fn total_bytes(&self) -> i64 {
        let num = self.num();
        num.total_allocd as i64 + num.deferred_alloc + num.allocd
    }

    /// Allocation delta since the previous call.
    pub fn diff_total_bytes(&self) -> i64 {
        let newtb = self.total_bytes();
        let oldtb = self.last_gc_total_bytes.get();
        self.last_gc_total_bytes.set(newtb);
        newtb - oldtb
    }

    /// Opt into conservative interior-pointer identification. The first
    /// call forces a full collection so the age bits become meaningful for
    /// the freelist-versus-object disambiguation.
    pub fn enable_conservative_gc_support(&mut self, mutator: &mut Mutator) -> bool {
        let prev = self.support_conservative.swap(true, Ordering::AcqRel);
        if !prev {
            self.collect(mutator, CollectionKind::Full);
        }
        prev
    }

    pub fn conservative_gc_support_enabled(&self) -> bool {
        self.support_conservative.load(Ordering::Relaxed)
    }

    /// Answer whether `p` points into a live heap object and return the
    /// object's base. Requires conservative support to be enabled.
    pub fn internal_obj_base_ptr(&self, p: *mut ()) -> Option<*mut Value> {
        debug_assert!(self.conservative_gc_support_enabled());
        unsafe { gc_internal_obj_base_ptr(self, p as usize) }
    }

    /// Largest object the pools serve.
    pub fn max_internal_obj_size(&self) -> usize {
        GC_MAX_SZCLASS
    }

    /// Header overhead of a big object.
    pub fn external_obj_hdr_size(&self) -> usize {
        std::mem::size_of::<BigVal>()
    }
}

impl Mutator {
    /// Request a collection.
    pub fn collect(&mut self, collection: CollectionKind) {
        let collector = self.collector.get();
        unsafe {
            (*collector).collect(self, collection);
        }
    }

    pub fn gc_enable(&mut self, on: bool) -> bool {
        let collector = self.collector.get();
        unsafe { (*collector).enable(self, on) }
    }

    pub fn gc_is_enabled(&self) -> bool {
        !self.disable_gc.get()
    }

    /// See [`Collector::enable_conservative_gc_support`].
    pub fn enable_conservative_gc_support(&mut self) -> bool {
        let collector = self.collector.get();
        unsafe { (*collector).enable_conservative_gc_support(self) }
    }
}

#[cfg(unix)]
fn os_total_memory() -> usize {
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGESIZE);
        if pages < 0 || page_size < 0 {
            return 0;
        }
        pages as usize * page_size as usize
    }
}

#[cfg(windows)]
fn os_total_memory() -> usize {
    0
}

#[cfg(target_os = "linux")]
fn os_free_memory() -> usize {
    unsafe {
        let pages = libc::sysconf(libc::_SC_AVPHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGESIZE);
        if pages < 0 || page_size < 0 {
            return 0;
        }
        pages as usize * page_size as usize
    }
}

#[cfg(not(target_os = "linux"))]
fn os_free_memory() -> usize {
    os_total_memory() / 2
}

#[cfg(target_os = "linux")]
fn os_maxrss() -> i64 {
    unsafe {
        let mut ru: libc::rusage = std::mem::zeroed();
        libc::getrusage(libc::RUSAGE_SELF, &mut ru);
        // ru_maxrss is in kilobytes
        ru.ru_maxrss as i64 * 1024
    }
}
