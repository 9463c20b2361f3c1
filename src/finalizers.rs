//! Finalizer registration, discovery and deferred execution.
//!
//! Lists hold `(object, callback)` pairs in flattened form. An object
//! pointer with its low bit set marks the callback as an unboxed C function
//! pointer; otherwise the callback is a managed value handed to the
//! runtime's dispatch hook. Per-mutator lists are read by other threads in
//! `finalize_object`, so their length is published with a release store and
//! consumed with an acquire load; all content writes stay below the
//! published length until the lock is taken for a resize.

use std::alloc::{alloc, dealloc, realloc, Layout};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex;

use crate::collect::Collector;
use crate::mark::ptr_clear_tag;
use crate::mutator::Mutator;
use crate::types::GcFrame;
use crate::value::Value;

/// Raw finalizer callback, invoked with the (untagged) object payload.
pub type PtrFinalizer = unsafe fn(*mut Value);

/// Flattened pair list with an atomically published length.
pub struct FinList {
    items: Cell<*mut *mut ()>,
    capacity: Cell<usize>,
    len: AtomicUsize,
}

unsafe impl Send for FinList {}
unsafe impl Sync for FinList {}

impl FinList {
    pub fn new() -> Self {
        Self {
            items: Cell::new(null_mut()),
            capacity: Cell::new(0),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn items(&self) -> *mut *mut () {
        self.items.get()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn len_acquire(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_len(&self, len: usize) {
        self.len.store(len, Ordering::Relaxed)
    }

    #[inline]
    pub fn set_len_release(&self, len: usize) {
        self.len.store(len, Ordering::Release)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make room for at least `extra` more entries. Caller holds the
    /// finalizers lock when readers may be concurrent.
    pub fn reserve(&self, extra: usize) {
        let len = self.len();
        let cap = self.capacity.get();
        if len + extra <= cap {
            return;
        }
        let new_cap = (cap * 2).max(len + extra).max(32);
        let new_items = unsafe {
            if cap == 0 {
                alloc(Layout::array::<*mut ()>(new_cap).unwrap())
            } else {
                realloc(
                    self.items.get().cast(),
                    Layout::array::<*mut ()>(cap).unwrap(),
                    new_cap * std::mem::size_of::<*mut ()>(),
                )
            }
        };
        assert!(!new_items.is_null(), "finalizer list allocation failed");
        self.items.set(new_items.cast());
        self.capacity.set(new_cap);
    }

    /// Single-writer push of one pair, no concurrent readers.
    pub fn push_pair(&self, v: *mut (), f: *mut ()) {
        self.reserve(2);
        let len = self.len();
        unsafe {
            self.items().add(len).write(v);
            self.items().add(len + 1).write(f);
        }
        self.set_len(len + 2);
    }

    #[inline]
    pub unsafe fn at(&self, i: usize) -> *mut () {
        self.items().add(i).read()
    }

    #[inline]
    pub unsafe fn set_at(&self, i: usize, v: *mut ()) {
        self.items().add(i).write(v)
    }

    pub fn clear(&self) {
        self.set_len(0);
    }

    /// Move all entries out, leaving the list empty.
    pub fn take_all(&self) -> Vec<(*mut (), *mut ())> {
        let len = self.len();
        let mut out = Vec::with_capacity(len / 2);
        for i in (0..len).step_by(2) {
            unsafe {
                out.push((self.at(i), self.at(i + 1)));
            }
        }
        self.set_len(0);
        out
    }
}

impl Drop for FinList {
    fn drop(&mut self) {
        let cap = self.capacity.get();
        if cap != 0 {
            unsafe {
                dealloc(
                    self.items.get().cast(),
                    Layout::array::<*mut ()>(cap).unwrap(),
                );
            }
        }
    }
}

impl Mutator {
    /// Register `f` (a managed value) to run after `v` becomes
    /// unreachable.
    pub fn add_finalizer(&self, v: *mut Value, f: *mut Value) {
        self.add_finalizer_(v.cast(), f.cast());
    }

    /// Register a raw C callback; distinguished from managed callbacks by
    /// the low tag bit on the object pointer.
    pub fn add_ptr_finalizer(&self, v: *mut Value, f: PtrFinalizer) {
        self.add_finalizer_((v as usize | 1) as *mut (), f as *mut ());
    }

    fn add_finalizer_(&self, v: *mut (), f: *mut ()) {
        let list = &self.finalizers;
        // The acquire load and the release store of the length synchronize
        // with `finalize_object` on another thread: content writes stay
        // invisible until the length is published.
        let oldlen = list.len.load(Ordering::Acquire);
        if oldlen + 2 > list.capacity.get() {
            let collector = self.collector_ref();
            collector.finalizers_lock.lock();
            list.reserve(2);
            unsafe {
                collector.finalizers_lock.unlock();
            }
        }
        unsafe {
            list.items().add(oldlen).write(v);
            list.items().add(oldlen + 1).write(f);
        }
        list.len.store(oldlen + 2, Ordering::Release);
    }

    /// Run every finalizer registered for `o` right now.
    pub fn finalize(&mut self, o: *mut Value) {
        let collector = self.collector_ref();
        collector.finalizers_lock.lock();
        let mut copied: Vec<(*mut (), *mut ())> = Vec::new();
        // No need to check the to_finalize list since the caller is still
        // holding a reference to the object.
        for i in 0..collector.mutators.len() {
            let m = collector.mutators[i];
            unsafe {
                finalize_object(&(*m).finalizers, o, &mut copied, (*m).tid != self.tid);
            }
        }
        finalize_object(&collector.finalizer_list_marked, o, &mut copied, false);
        unsafe {
            collector.finalizers_lock.unlock();
        }
        if !copied.is_empty() {
            run_finalizers_in_list(self, copied);
        }
    }

    /// Nested enable/disable of finalizer execution on this thread.
    pub fn enable_finalizers(&mut self, on: bool) {
        let old = self.finalizers_inhibited.get();
        let new = old + if on { -1 } else { 1 };
        if new < 0 {
            static WARNED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
            if !WARNED.swap(true, Ordering::Relaxed) {
                eprintln!(
                    "WARNING: GC finalizers already enabled on this thread.\n{:?}",
                    std::backtrace::Backtrace::capture()
                );
            }
            return;
        }
        self.finalizers_inhibited.set(new);
        if self
            .collector_ref()
            .have_pending_finalizers
            .load(Ordering::Relaxed)
        {
            self.run_pending_finalizers();
        }
    }

    pub fn run_pending_finalizers(&mut self) {
        if !self.in_finalizer.get() && self.finalizers_inhibited.get() == 0 {
            self.in_finalizer.set(true);
            run_finalizers(self);
            self.in_finalizer.set(false);
        }
    }
}

/// Queue a ready pair; serviced after the collection.
pub(crate) fn schedule_finalization(collector: &Collector, o: *mut (), f: *mut ()) {
    collector.to_finalize.push_pair(o, f);
    collector
        .have_pending_finalizers
        .store(true, Ordering::Relaxed);
}

/// Move every pair registered for `o` from `list` into `copied`. When
/// `need_sync` is set, `list` belongs to another thread: mutations are
/// confined to the acquired prefix and the shortened length is published
/// with a compare-exchange.
pub(crate) fn finalize_object(
    list: &FinList,
    o: *mut Value,
    copied: &mut Vec<(*mut (), *mut ())>,
    need_sync: bool,
) {
    let oldlen = if need_sync { list.len_acquire() } else { list.len() };
    let mut j = 0;
    unsafe {
        for i in (0..oldlen).step_by(2) {
            let v = list.at(i);
            let matches = o == ptr_clear_tag(v).cast();
            if matches {
                copied.push((v, list.at(i + 1)));
            }
            if !(matches || v.is_null()) {
                if j < i {
                    list.set_at(j, list.at(i));
                    list.set_at(j + 1, list.at(i + 1));
                }
                j += 2;
            }
        }
    }
    if j == oldlen {
        return;
    }
    if need_sync {
        // zero the tail before publishing the shorter length; the owner
        // might have pushed concurrently, in which case the exchange fails
        // and its entries stay where they are
        unsafe {
            for i in j..oldlen {
                list.set_at(i, null_mut());
            }
        }
        let _ = list
            .len
            .compare_exchange(oldlen, j, Ordering::AcqRel, Ordering::Relaxed);
    } else {
        list.set_len(j);
    }
}

fn run_finalizer(mutator: &mut Mutator, o: *mut (), ff: *mut ()) {
    let tagged = o as usize & 1 != 0;
    let o = ptr_clear_tag(o);
    let result = if tagged {
        let f: PtrFinalizer = unsafe { std::mem::transmute(ff) };
        catch_unwind(AssertUnwindSafe(|| unsafe { f(o.cast()) }))
    } else {
        let dispatch = mutator.collector_ref().finalizer_dispatch;
        match dispatch {
            Some(dispatch) => {
                catch_unwind(AssertUnwindSafe(|| unsafe {
                    dispatch(ff.cast(), o.cast())
                }))
            }
            None => Ok(()),
        }
    };
    if let Err(e) = result {
        eprintln!("error in running finalizer: {:?}", payload_str(&e));
    }
}

fn payload_str(e: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = e.downcast_ref::<&str>() {
        s
    } else if let Some(s) = e.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Run the pairs in `copied`, newest registration first. The list is
/// rooted through a shadow stack frame for the duration: finalizer code
/// runs with the world restarted and may itself allocate and collect.
fn run_finalizers_in_list(mutator: &mut Mutator, copied: Vec<(*mut (), *mut ())>) {
    let npairs = copied.len();
    // frame layout: [nroots, prev, slots...]; tagged objects make the
    // scanner skip the adjacent raw callback slot
    let mut frame: Vec<usize> = Vec::with_capacity(2 + npairs * 2);
    frame.push((npairs * 2) << 2);
    frame.push(0);
    for (o, f) in copied.iter() {
        frame.push(*o as usize);
        frame.push(*f as usize);
    }
    unsafe {
        mutator.push_gc_frame(frame.as_mut_ptr().cast::<GcFrame>());
    }
    // reverse registration order, so lower-level finalizers run last
    for (o, f) in copied.into_iter().rev() {
        run_finalizer(mutator, o, f);
    }
    unsafe {
        mutator.pop_gc_frame();
    }
}

/// Drain `to_finalize` and run everything on the calling mutator.
pub(crate) fn run_finalizers(mutator: &mut Mutator) {
    let collector = mutator.collector_ref();
    // racy fast path: if another thread is pushing under the lock it will
    // also flush, so an empty read here is fine
    if collector.to_finalize.is_empty() {
        return;
    }
    collector.finalizers_lock.lock();
    let copied = collector.to_finalize.take_all();
    collector
        .have_pending_finalizers
        .store(false, Ordering::Relaxed);
    unsafe {
        collector.finalizers_lock.unlock();
    }
    if copied.is_empty() {
        return;
    }
    run_finalizers_in_list(mutator, copied);
}

pub(crate) fn schedule_all_finalizers(collector: &Collector, list: &FinList) {
    let len = list.len();
    unsafe {
        for i in (0..len).step_by(2) {
            let v = list.at(i);
            let f = list.at(i + 1);
            if v.is_null() {
                continue;
            }
            collector.to_finalize.push_pair(v, f);
        }
    }
    if len != 0 {
        collector
            .have_pending_finalizers
            .store(true, Ordering::Relaxed);
    }
    list.set_len(0);
}

/// Discovery pass, run while the world is stopped after marking: dead
/// pairs move to `to_finalize`; pairs whose object *and* callback are both
/// old-and-marked move to the global marked list so they are not rescanned
/// every quick cycle. The caller relies on moved pairs being appended to
/// the end of the marked list.
pub(crate) unsafe fn sweep_finalizer_list(collector: &Collector, list: *mut FinList) {
    let is_marked_list = std::ptr::eq(list, &collector.finalizer_list_marked);
    let list = &*list;
    let len = list.len();
    let mut j = 0;
    let mut i = 0;
    while i < len {
        let v0 = list.at(i);
        if v0.is_null() {
            i += 2;
            continue;
        }
        let fin = list.at(i + 1);
        let v = ptr_clear_tag(v0).cast::<crate::value::Value>();
        let bits = (*crate::value::as_tagged(v)).bits();
        let isfreed = !crate::value::gc_marked(bits);
        let isold = !(v0 as usize & 1 != 0)
            && !is_marked_list
            && bits == crate::value::GC_OLD_MARKED
            && (*crate::value::as_tagged(fin.cast())).bits() == crate::value::GC_OLD_MARKED;
        if !(isfreed || isold) {
            if j < i {
                list.set_at(j, list.at(i));
                list.set_at(j + 1, list.at(i + 1));
            }
            j += 2;
        }
        if isfreed {
            schedule_finalization(collector, v0, fin);
        }
        if isold {
            collector.finalizer_list_marked.push_pair(v0, fin);
        }
        i += 2;
    }
    list.set_len(j);
}

/// Schedule and run every registered finalizer; used at runtime shutdown.
pub fn run_all_finalizers(mutator: &mut Mutator) {
    let collector = mutator.collector_ref();
    collector.finalizers_lock.lock();
    unsafe {
        schedule_all_finalizers(collector, &collector.finalizer_list_marked);
        for i in 0..collector.mutators.len() {
            let m = collector.mutators[i];
            schedule_all_finalizers(collector, &(*m).finalizers);
        }
        collector.finalizers_lock.unlock();
    }
    run_finalizers(mutator);
}
