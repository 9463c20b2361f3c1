//! Mutator threads and their thread-local collector state.
//!
//! Every thread that allocates owns a `Mutator`: its size-class pools, its
//! remembered set, its finalizer list and its share of the counters. The
//! `gc_state` word is the safepoint protocol: `Running` while executing
//! managed code, `Waiting` when parked for a collection, `Safe` inside
//! blocking regions where the collector may proceed without us.

use std::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
    sync::Arc,
};

use atomic::{Atomic, Ordering};
use parking_lot::{Condvar, Mutex};

use crate::{
    collect::{CollectionKind, Collector},
    finalizers::FinList,
    heap::ThreadHeap,
    stats::ThreadGcNum,
    types::GcFrame,
    value::Value,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcState {
    /// Executing managed code; the collector must wait for this thread.
    Running = 0,
    /// Parked at a safepoint for the duration of a collection.
    Waiting = 1,
    /// Inside a blocking region; the collector may run without us, but we
    /// must re-check the safepoint when leaving.
    Safe = 2,
}

impl GcState {
    /// Whether the collector can treat the thread as stopped.
    #[inline]
    pub fn parked_ok(self) -> bool {
        self != GcState::Running
    }
}

pub struct Mutator {
    pub(crate) collector: Arc<UnsafeCell<Collector>>,
    pub(crate) tid: u16,
    pub(crate) state: Atomic<GcState>,
    pub(crate) dead: Cell<bool>,

    pub(crate) heap: Box<ThreadHeap>,
    pub(crate) gc_num: ThreadGcNum,
    pub(crate) finalizers: FinList,
    /// Objects whose types opted into a foreign sweep pass.
    pub(crate) sweep_objs: Vec<*mut Value>,

    pub(crate) disable_gc: Cell<bool>,
    pub(crate) in_finalizer: Cell<bool>,
    pub(crate) finalizers_inhibited: Cell<i32>,

    /// Shadow stack of the currently running task.
    pub gcstack: Cell<*mut GcFrame>,
    /// Task root slots, set by the scheduler.
    pub current_task: Cell<*mut Value>,
    pub root_task: Cell<*mut Value>,
    pub next_task: Cell<*mut Value>,
    pub previous_task: Cell<*mut Value>,
    pub previous_exception: Cell<*mut Value>,
    /// Backtrace buffer; elements follow the exception stack encoding.
    pub bt_buf: Vec<usize>,

    join_data: Arc<JoinDataInternal>,
    rc: u32,
}

impl Mutator {
    pub(crate) fn new(
        collector: Arc<UnsafeCell<Collector>>,
        interval: usize,
        join_data: Arc<JoinDataInternal>,
    ) -> Mutator {
        let gc_num = ThreadGcNum::new();
        gc_num.allocd.store(-(interval as i64), Ordering::Relaxed);
        Mutator {
            collector,
            tid: 0,
            state: Atomic::new(GcState::Safe),
            dead: Cell::new(false),
            heap: Box::new(ThreadHeap::new()),
            gc_num,
            finalizers: FinList::new(),
            sweep_objs: Vec::new(),
            disable_gc: Cell::new(false),
            in_finalizer: Cell::new(false),
            finalizers_inhibited: Cell::new(0),
            gcstack: Cell::new(null_mut()),
            current_task: Cell::new(null_mut()),
            root_task: Cell::new(null_mut()),
            next_task: Cell::new(null_mut()),
            previous_task: Cell::new(null_mut()),
            previous_exception: Cell::new(null_mut()),
            bt_buf: Vec::new(),
            join_data,
            rc: 1,
        }
    }

    #[inline]
    pub(crate) fn collector_ref(&self) -> &mut Collector {
        unsafe { &mut *self.collector.get() }
    }

    /// The collector this mutator is attached to.
    #[inline]
    pub fn collector(&self) -> &Collector {
        unsafe { &*self.collector.get() }
    }

    /// Mutable collector access for setup-time configuration (callback
    /// registration, hooks, global roots).
    ///
    /// # Safety
    /// Must not race a collection or another configuration call.
    pub unsafe fn collector_mut(&self) -> &mut Collector {
        &mut *self.collector.get()
    }

    /// Spawn a new mutator thread attached to the same collector.
    pub fn spawn_mutator<F>(&self, closure: F) -> JoinData
    where
        F: FnOnce(MutatorRef) + Send + 'static,
    {
        let state = self.enter_safe();
        let join_data = JoinData::new();
        let mut mutator = MutatorRef::new(Mutator::new(
            self.collector.clone(),
            self.collector_ref().gc_num.interval,
            join_data.internal.clone(),
        ));
        self.collector_ref().attach_mutator(&mut *mutator);
        drop(state);
        std::thread::spawn(move || {
            mutator.state_set(GcState::Running, GcState::Safe);
            closure(mutator.clone());
            mutator.stop();
            drop(mutator);
        });
        join_data
    }

    #[inline]
    pub fn tid(&self) -> u16 {
        self.tid
    }

    /// Park until the in-flight collection (if any) finishes.
    pub(crate) fn set_gc_and_wait(&self) {
        let state = self.state.load(Ordering::Relaxed);
        self.state.store(GcState::Waiting, Ordering::Release);
        self.collector_ref().safepoint.wait_gc();
        self.state.store(state, Ordering::Release);
    }

    /// The safepoint poll. Cheap enough for allocation slow paths and
    /// user-placed polls; returns true if we parked.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        if self.collector_ref().safepoint.gc_requested() {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn safepoint_slow(&self) {
        self.set_gc_and_wait();
    }

    pub(crate) fn state_set(&self, state: GcState, old_state: GcState) -> GcState {
        self.state.store(state, Ordering::Release);
        if old_state.parked_ok() && !state.parked_ok() {
            // transitioning back to managed code must honor a pending stop
            self.safepoint();
        }
        old_state
    }

    pub(crate) fn state_save_and_set(&self, state: GcState) -> GcState {
        self.state_set(state, self.state.load(Ordering::Relaxed))
    }

    /// Enter a region where the collector may run without this thread
    /// (blocking syscalls, long FFI calls).
    pub fn enter_safe(&self) -> StateGuard {
        let old = self.state_save_and_set(GcState::Safe);
        StateGuard {
            mutator: self,
            old_state: old,
        }
    }

    /// Per-thread allocation counter, also the collection trigger: it
    /// starts at `-interval` and a collection is due when it reaches zero.
    #[inline(always)]
    pub(crate) fn count_alloc(&self, sz: usize) {
        let n = &self.gc_num.allocd;
        n.store(n.load(Ordering::Relaxed) + sz as i64, Ordering::Relaxed);
    }

    /// Trigger point inserted into every allocation slow path.
    #[inline]
    pub fn maybe_collect(&mut self) {
        if self.gc_num.allocd.load(Ordering::Relaxed) >= 0 {
            let collector = self.collector.get();
            unsafe {
                (*collector).collect(self, CollectionKind::Auto);
            }
        } else {
            self.safepoint();
        }
    }

    /// Push a shadow stack frame. The frame must stay alive until the
    /// matching `pop_gc_frame`.
    ///
    /// # Safety
    /// `frame.nroots`/root slots must be initialized; frames must nest.
    pub unsafe fn push_gc_frame(&self, frame: *mut GcFrame) {
        (*frame).prev = self.gcstack.get();
        self.gcstack.set(frame);
    }

    /// # Safety
    /// Must match the most recent `push_gc_frame`.
    pub unsafe fn pop_gc_frame(&self) {
        let frame = self.gcstack.get();
        debug_assert!(!frame.is_null());
        self.gcstack.set((*frame).prev);
    }

    pub(crate) fn stop(&self) {
        let mut running = self.join_data.running.lock();
        *running = false;
        self.join_data.cv_stopped.notify_all();
    }
}

/// Restores the saved `gc_state` on drop.
pub struct StateGuard<'a> {
    mutator: &'a Mutator,
    old_state: GcState,
}

impl<'a> Drop for StateGuard<'a> {
    fn drop(&mut self) {
        self.mutator.state_save_and_set(self.old_state);
    }
}

pub(crate) struct JoinDataInternal {
    running: Mutex<bool>,
    cv_stopped: Condvar,
}

impl JoinDataInternal {
    fn new() -> JoinDataInternal {
        JoinDataInternal {
            running: Mutex::new(true),
            cv_stopped: Condvar::new(),
        }
    }
}

/// Returned by `spawn_mutator`; joining through it keeps the joining
/// thread in a GC-safe state so it cannot deadlock a collection.
pub struct JoinData {
    pub(crate) internal: Arc<JoinDataInternal>,
}

impl JoinData {
    pub(crate) fn new() -> Self {
        Self {
            internal: Arc::new(JoinDataInternal::new()),
        }
    }

    pub fn join(self, mutator: &Mutator) {
        let state = mutator.enter_safe();
        let mut running = self.internal.running.lock();
        while *running {
            self.internal.cv_stopped.wait(&mut running);
        }
        drop(running);
        drop(state);
    }
}

/// Reference-counted handle to a heap-allocated `Mutator`.
///
/// When the last handle drops the mutator detaches from the collector but
/// its allocation is kept: its pools and big objects may still hold data
/// reachable from other threads, and the sweep keeps walking them.
pub struct MutatorRef {
    mutator: NonNull<Mutator>,
}

unsafe impl Send for MutatorRef {}

impl MutatorRef {
    pub fn new(mutator: Mutator) -> Self {
        Self {
            mutator: unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(mutator))) },
        }
    }
}

impl Deref for MutatorRef {
    type Target = Mutator;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutator.as_ptr() }
    }
}

impl DerefMut for MutatorRef {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutator.as_ptr() }
    }
}

impl Clone for MutatorRef {
    fn clone(&self) -> Self {
        unsafe {
            (*self.mutator.as_ptr()).rc += 1;
            Self {
                mutator: self.mutator,
            }
        }
    }
}

impl Drop for MutatorRef {
    fn drop(&mut self) {
        unsafe {
            let m = self.mutator.as_ptr();
            (*m).rc -= 1;
            if (*m).rc == 0 {
                // park for good: the allocation is kept (pools and big
                // objects may outlive the thread), the collector just stops
                // treating us as a running mutator
                (*m).state.store(GcState::Safe, Ordering::Release);
                (*m).collector_ref().detach_mutator(m);
                (*m).stop();
            }
        }
    }
}
