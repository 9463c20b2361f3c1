//! Marking phase: coloring primitives, type-directed field scanners, the
//! write barriers, and the mark loop (serial, or parallel over the
//! work-stealing deques).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex;

use crate::collect::Collector;
use crate::deque::WsDeque;
use crate::finalizers::FinList;
use crate::heap::{MarkCache, MARK_CACHE_BIG};
use crate::mark_queue::MarkQueue;
use crate::mutator::Mutator;
use crate::page::{gc_page_data, PageMeta, GC_PAGE_OFFSET};
use crate::size_classes::GC_MAX_SZCLASS;
use crate::types::{
    Array, ExcStack, FieldDesc, GcFrame, Module, ObjVec, Task, HT_NOTFOUND,
    ARRAY_BUFFERED, ARRAY_MALLOC, ARRAY_OWNED,
};
use crate::value::{
    as_tagged, gc_marked, gc_old, gc_set_bits, BigVal, GcString, TaggedValue, Value, GC_MARKED,
    GC_OLD, GC_OLD_MARKED, WORD,
};

#[inline(always)]
pub(crate) fn ptr_tag(v: *mut ()) -> bool {
    v as usize & 1 != 0
}

#[inline(always)]
pub(crate) fn ptr_clear_tag(v: *mut ()) -> *mut () {
    (v as usize & !1) as *mut ()
}

/// Handle the case where a task stack is only partially copied: addresses
/// inside `[lb, ub)` are relocated by `offset` before the read.
#[inline(always)]
unsafe fn gc_read_stack(addr: *const usize, offset: usize, lb: usize, ub: usize) -> usize {
    let a = addr as usize;
    let real = if a >= lb && a < ub { a + offset } else { a };
    (real as *const usize).read()
}

/// One marking context. The collector thread owns one; each parallel
/// marker owns one wrapping a work-stealing deque. Side effects (byte
/// counters, big-object transitions, remset insertions) are buffered
/// locally and flushed when the loop finishes, so the scan itself never
/// takes a lock.
pub struct Marker<'a> {
    pub(crate) collector: &'a Collector,
    /// The collecting mutator; flush target for big-object transitions.
    pub(crate) master: *mut Mutator,
    queue: MarkQueue,
    deque: Option<&'a WsDeque>,
    pub(crate) cache: MarkCache,
    remset: Vec<*mut Value>,
    remset_nptr: usize,
    /// Permanent-image objects tagged this cycle; a full sweep demotes
    /// them so they can be traversed again.
    perm_marked: Vec<usize>,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(collector: &'a Collector, master: *mut Mutator) -> Self {
        Self {
            collector,
            master,
            queue: MarkQueue::new(),
            deque: None,
            cache: MarkCache::new(),
            remset: Vec::new(),
            remset_nptr: 0,
            perm_marked: Vec::new(),
        }
    }

    pub(crate) fn with_deque(
        collector: &'a Collector,
        master: *mut Mutator,
        deque: &'a WsDeque,
    ) -> Self {
        Self {
            collector,
            master,
            queue: MarkQueue::new(),
            deque: Some(deque),
            cache: MarkCache::new(),
            remset: Vec::new(),
            remset_nptr: 0,
            perm_marked: Vec::new(),
        }
    }

    #[inline(always)]
    fn push(&mut self, v: *mut Value) {
        match self.deque {
            Some(d) => d.push(v),
            None => self.queue.push(v),
        }
    }

    #[inline(always)]
    fn pop(&mut self) -> Option<*mut Value> {
        match self.deque {
            Some(d) => d.pop(),
            None => self.queue.pop(),
        }
    }

    pub(crate) fn take_queue(&mut self) -> MarkQueue {
        std::mem::replace(&mut self.queue, MarkQueue::new())
    }

    /// Claim an object's mark bit. Returns true when this marker is the
    /// claimer. The whole header is replaced with one relaxed exchange;
    /// with the reset-age mode active the object is re-tagged as if just
    /// allocated.
    #[inline]
    pub(crate) unsafe fn try_setmark_tag(&self, o: *mut TaggedValue, mut mark_mode: usize) -> bool {
        debug_assert!(gc_marked(mark_mode));
        let mut tag = (*o).header();
        if gc_marked(tag) {
            return false;
        }
        if self.collector.mark_reset_age.get() {
            // reset the object as if it was just allocated
            mark_mode = GC_MARKED;
            tag = gc_set_bits(tag, mark_mode);
        } else {
            if gc_old(tag) {
                mark_mode = GC_OLD_MARKED;
            }
            tag |= mark_mode;
            debug_assert!(tag & 3 == mark_mode);
        }
        let tag = (*o).exchange_header(tag);
        !gc_marked(tag)
    }

    /// Buffer a big-object list transition; the low bit records "back to
    /// the young list".
    unsafe fn queue_big_marked(&mut self, hdr: *mut BigVal, toyoung: bool) {
        if self.cache.nbig_obj >= MARK_CACHE_BIG {
            self.sync_cache();
        }
        let v = hdr as usize;
        self.cache.big_obj[self.cache.nbig_obj] = if toyoung { (v | 1) as *mut () } else { v as *mut () };
        self.cache.nbig_obj += 1;
    }

    /// Flush the cache under the cache lock: relink buffered big objects
    /// and fold the byte counters into the global totals.
    pub(crate) unsafe fn sync_cache(&mut self) {
        let collector = self.collector;
        collector.gc_cache_lock.lock();
        for i in 0..self.cache.nbig_obj {
            let ptr = self.cache.big_obj[i];
            let hdr = ptr_clear_tag(ptr) as *mut BigVal;
            BigVal::unlink(hdr);
            if ptr_tag(ptr) {
                BigVal::link(hdr, &mut (*self.master).heap.big_objects);
            } else {
                // move hdr from the thread-local list to `big_objects_marked`
                BigVal::link(hdr, collector.big_objects_marked.get());
            }
        }
        self.cache.nbig_obj = 0;
        collector
            .perm_scanned_bytes
            .fetch_add(self.cache.perm_scanned_bytes as i64, Ordering::Relaxed);
        collector
            .scanned_bytes
            .fetch_add(self.cache.scanned_bytes as i64, Ordering::Relaxed);
        self.cache.perm_scanned_bytes = 0;
        self.cache.scanned_bytes = 0;
        if !self.perm_marked.is_empty() {
            (*collector.perm_marked.get()).extend_from_slice(&self.perm_marked);
            self.perm_marked.clear();
        }
        collector.gc_cache_lock.unlock();
    }

    /// Append the buffered remset entries to the collecting mutator. Runs
    /// once per marker after its loop, under the cache lock so parallel
    /// markers never race on the remset vector.
    pub(crate) unsafe fn flush_remset(&mut self) {
        self.collector.gc_cache_lock.lock();
        let heap = &mut (*self.master).heap;
        heap.remset.extend_from_slice(&self.remset);
        heap.remset_nptr += self.remset_nptr;
        self.remset.clear();
        self.remset_nptr = 0;
        self.collector.gc_cache_lock.unlock();
    }

    /// Called exactly once per marked big object to update its metadata.
    unsafe fn setmark_big(&mut self, o: *mut TaggedValue, mark_mode: usize) {
        debug_assert!(self
            .collector
            .page_alloc
            .memory_map()
            .page_metadata(o as usize)
            .is_null());
        let hdr = BigVal::from_tagged(o);
        if mark_mode == GC_OLD_MARKED {
            self.cache.perm_scanned_bytes += (*hdr).size() as isize;
            self.queue_big_marked(hdr, false);
        } else {
            self.cache.scanned_bytes += (*hdr).size() as isize;
            // age 0 means the object is already on a young list
            if self.collector.mark_reset_age.get() && (*hdr).age() != 0 {
                (*hdr).set_age(0);
                self.queue_big_marked(hdr, true);
            }
        }
    }

    /// Called exactly once per marked pool object to update the page.
    unsafe fn setmark_pool_page(
        &mut self,
        o: *mut TaggedValue,
        mark_mode: usize,
        page: *mut PageMeta,
    ) {
        let osize = (*page).osize as usize;
        if mark_mode == GC_OLD_MARKED {
            self.cache.perm_scanned_bytes += osize as isize;
            (*page).nold.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache.scanned_bytes += osize as isize;
            if self.collector.mark_reset_age.get() {
                // reset the age bit as if the cell was just allocated
                (*page).has_young.store(1, Ordering::Relaxed);
                let page_begin = gc_page_data(o as usize) as usize + GC_PAGE_OFFSET;
                let obj_id = (o as usize - page_begin) / osize;
                let ages = (*page).ages.add(obj_id / 8);
                (*(ages as *const AtomicU8)).fetch_and(!(1 << (obj_id % 8)), Ordering::Relaxed);
            }
        }
        (*page).has_marked.store(1, Ordering::Relaxed);
    }

    unsafe fn setmark_pool(&mut self, o: *mut TaggedValue, mark_mode: usize) {
        let page = self
            .collector
            .page_alloc
            .memory_map()
            .page_metadata(o as usize);
        debug_assert!(!page.is_null());
        self.setmark_pool_page(o, mark_mode, page);
    }

    unsafe fn setmark(&mut self, o: *mut TaggedValue, mark_mode: usize, sz: usize) {
        if sz <= GC_MAX_SZCLASS {
            self.setmark_pool(o, mark_mode);
        } else {
            self.setmark_big(o, mark_mode);
        }
    }

    /// Mark a gc-internal buffer (array storage, exception stack,
    /// binding). The size estimate routes the metadata update; a pool
    /// lookup double-checks it.
    pub(crate) unsafe fn setmark_buf(&mut self, o: *mut Value, mark_mode: usize, minsz: usize) {
        let buf = as_tagged(o);
        let bits = if gc_old((*buf).header()) && !self.collector.mark_reset_age.get() {
            GC_OLD_MARKED
        } else {
            GC_MARKED
        };
        if self.try_setmark_tag(buf, mark_mode) {
            if minsz <= GC_MAX_SZCLASS {
                let page = self
                    .collector
                    .page_alloc
                    .memory_map()
                    .page_metadata(buf as usize);
                if !page.is_null() {
                    self.setmark_pool_page(buf, bits, page);
                    return;
                }
            }
            self.setmark_big(buf, bits);
        }
    }

    /// Check `nptr` for `old & refs-young` and remember the parent.
    #[inline]
    unsafe fn mark_push_remset(&mut self, obj: *mut Value, nptr: usize) {
        if nptr & 3 == 3 {
            self.remset_nptr += nptr >> 2;
            self.remset.push(obj);
        }
    }

    /// Claim and enqueue an unmarked object; sets the low bit of `nptr`
    /// when the child is young.
    #[inline]
    unsafe fn try_claim_and_push(&mut self, v: *mut Value, nptr: Option<&mut usize>) {
        if v.is_null() {
            return;
        }
        let o = as_tagged(v);
        if !gc_old((*o).header()) {
            if let Some(n) = nptr {
                *n |= 1;
            }
        }
        if self.try_setmark_tag(o, GC_MARKED) {
            self.push(v);
        }
    }

    /// External root hook: claim `obj` and enqueue it. Returns whether
    /// this call was the claimer.
    pub fn mark_queue_obj(&mut self, obj: *mut Value) -> bool {
        unsafe {
            let claimed = self.try_setmark_tag(as_tagged(obj), GC_MARKED);
            if claimed {
                self.push(obj);
            }
            claimed
        }
    }

    /// External root hook for whole arrays of values.
    pub fn mark_queue_objarray(&mut self, parent: *mut Value, objs: *mut *mut Value, nobjs: usize) {
        unsafe {
            let nptr = (nobjs << 2) | (*as_tagged(parent)).bits() & GC_OLD;
            self.mark_objarray(parent, objs, objs.add(nobjs), 1, nptr)
        }
    }

    /// Scan fixed slots at byte-table offsets (word indices).
    unsafe fn mark_obj8(&mut self, parent: *mut Value, offsets: &[u8], mut nptr: usize) {
        let slots = parent as *mut *mut Value;
        for &off in offsets {
            let new_obj = slots.add(off as usize).read();
            self.try_claim_and_push(new_obj, Some(&mut nptr));
        }
        self.mark_push_remset(parent, nptr);
    }

    unsafe fn mark_obj16(&mut self, parent: *mut Value, offsets: &[u16], mut nptr: usize) {
        let slots = parent as *mut *mut Value;
        for &off in offsets {
            let new_obj = slots.add(off as usize).read();
            self.try_claim_and_push(new_obj, Some(&mut nptr));
        }
        self.mark_push_remset(parent, nptr);
    }

    unsafe fn mark_obj32(&mut self, parent: *mut Value, offsets: &[u32], mut nptr: usize) {
        let slots = parent as *mut *mut Value;
        for &off in offsets {
            let new_obj = slots.add(off as usize).read();
            self.try_claim_and_push(new_obj, Some(&mut nptr));
        }
        self.mark_push_remset(parent, nptr);
    }

    /// Contiguous array of value pointers, with an element stride for
    /// arrays of inline structs with a single pointer field.
    unsafe fn mark_objarray(
        &mut self,
        parent: *mut Value,
        mut begin: *mut *mut Value,
        end: *mut *mut Value,
        step: usize,
        mut nptr: usize,
    ) {
        while begin < end {
            let new_obj = begin.read();
            self.try_claim_and_push(new_obj, Some(&mut nptr));
            begin = begin.add(step);
        }
        self.mark_push_remset(parent, nptr);
    }

    /// Array of inline structs with 8-bit pointer-offset tables.
    unsafe fn mark_array8(
        &mut self,
        parent: *mut Value,
        mut begin: *mut *mut Value,
        end: *mut *mut Value,
        elem_words: usize,
        offsets: &[u8],
        mut nptr: usize,
    ) {
        while begin < end {
            for &off in offsets {
                let new_obj = begin.add(off as usize).read();
                self.try_claim_and_push(new_obj, Some(&mut nptr));
            }
            begin = begin.add(elem_words);
        }
        self.mark_push_remset(parent, nptr);
    }

    unsafe fn mark_array16(
        &mut self,
        parent: *mut Value,
        mut begin: *mut *mut Value,
        end: *mut *mut Value,
        elem_words: usize,
        offsets: &[u16],
        mut nptr: usize,
    ) {
        while begin < end {
            for &off in offsets {
                let new_obj = begin.add(off as usize).read();
                self.try_claim_and_push(new_obj, Some(&mut nptr));
            }
            begin = begin.add(elem_words);
        }
        self.mark_push_remset(parent, nptr);
    }

    /// Walk a chain of shadow stack frames. A root slot with its low bit
    /// set is a finalizer entry: the next slot holds an unboxed C function
    /// pointer and is skipped.
    pub(crate) unsafe fn mark_stack(
        &mut self,
        mut s: *mut GcFrame,
        offset: usize,
        lb: usize,
        ub: usize,
    ) {
        let mut nroots = gc_read_stack(std::ptr::addr_of!((*s).nroots), offset, lb, ub);
        let mut nr = nroots >> 2;
        loop {
            let rts = GcFrame::roots(s);
            let mut i = 0;
            while i < nr {
                let new_obj = if nroots & 1 != 0 {
                    let slot = gc_read_stack(rts.add(i).cast(), offset, lb, ub) as *const usize;
                    gc_read_stack(slot, offset, lb, ub) as *mut Value
                } else {
                    let obj = gc_read_stack(rts.add(i).cast(), offset, lb, ub) as *mut Value;
                    if ptr_tag(obj.cast()) {
                        // tagged finalizer entry: the adjacent slot is a raw
                        // C callback, not a value
                        i += 1;
                        ptr_clear_tag(obj.cast()).cast()
                    } else {
                        obj
                    }
                };
                self.try_claim_and_push(new_obj, None);
                i += 1;
            }
            s = gc_read_stack(std::ptr::addr_of!((*s).prev).cast(), offset, lb, ub)
                as *mut GcFrame;
            if s.is_null() {
                break;
            }
            nroots = gc_read_stack(std::ptr::addr_of!((*s).nroots), offset, lb, ub);
            nr = nroots >> 2;
        }
    }

    /// Walk exception stack records, newest first, skipping native frames.
    unsafe fn mark_excstack(&mut self, excstack: *mut ExcStack, mut itr: usize) {
        let data = ExcStack::data(excstack);
        while itr > 0 {
            let bt_size = data.add(itr - 2).read();
            let bt_data = data.add(itr - 2 - bt_size);
            for i in 0..bt_size {
                let e = bt_data.add(i).read();
                if e != 0 && e & 1 == 0 {
                    self.try_claim_and_push(e as *mut Value, None);
                }
            }
            // the exception comes last
            let exception = data.add(itr - 1).read() as *mut Value;
            itr = itr - 2 - bt_size;
            self.try_claim_and_push(exception, None);
        }
    }

    /// Mark a binding cell itself (bindings in the permanent image are
    /// tag-marked only).
    unsafe fn mark_binding_cell(&mut self, b: *mut crate::types::Binding, bits: usize) {
        if self.collector.in_perm_region(b as usize) {
            if self.try_setmark_tag(as_tagged(b.cast()), GC_OLD_MARKED) {
                self.perm_marked.push(as_tagged(b.cast()) as usize);
            }
        } else {
            self.setmark_buf(b.cast(), bits, std::mem::size_of::<crate::types::Binding>());
        }
    }

    /// Iterate a module's binding table; `HT_NOTFOUND` holes are skipped.
    unsafe fn mark_module_binding(&mut self, parent: *mut Value, mut nptr: usize, bits: usize) {
        let m = parent.cast::<Module>();
        let table = (*m).bindings;
        let size = (*m).bindings_size;
        let mut i = 1;
        while i < size {
            let b = table.add(i).read();
            if b != HT_NOTFOUND && !b.is_null() {
                self.mark_binding_cell(b, bits);
                let value = (*b).value.load(Ordering::Relaxed);
                let globalref = (*b).globalref.load(Ordering::Relaxed);
                self.try_claim_and_push(value, Some(&mut nptr));
                self.try_claim_and_push(globalref, Some(&mut nptr));
            }
            i += 2;
        }
        self.try_claim_and_push((*m).parent, Some(&mut nptr));
        let nusings = (*m).usings_len;
        if nusings > 0 {
            // the usings list may hold the only reference to a replaced
            // module
            let begin = (*m).usings;
            self.mark_objarray(parent, begin, begin.add(nusings), 1, nptr);
        } else {
            self.mark_push_remset(parent, nptr);
        }
    }

    /// Mark a finalizer-format list: pairs of `(object, callback)`, the
    /// object possibly carrying the raw-callback tag.
    pub(crate) unsafe fn mark_finlist(&mut self, list: &FinList, start: usize) {
        let len = list.len();
        if len <= start {
            return;
        }
        let mut i = start;
        while i < len {
            let mut new_obj = list.at(i) as *mut Value;
            if new_obj.is_null() {
                i += 1;
                continue;
            }
            if ptr_tag(new_obj.cast()) {
                new_obj = ptr_clear_tag(new_obj.cast()).cast();
                // skip the raw callback slot
                i += 1;
                debug_assert!(i < len);
            }
            self.try_claim_and_push(new_obj, None);
            i += 1;
        }
    }

    #[cold]
    unsafe fn corrupt_type_fail(&self, v: *mut Value) -> ! {
        let o = as_tagged(v);
        eprintln!(
            "GC error (probable corruption): object {:p} has header {:#x} with no valid layout",
            v,
            (*o).header()
        );
        eprintln!("queued objects remaining: {}", self.queue.len());
        std::process::abort();
    }

    /// Enqueue and mark all outgoing references of `new_obj` which have
    /// not been marked yet. `meta_updated` is set for remset entries so
    /// their metadata is not counted twice.
    pub(crate) unsafe fn mark_outrefs(&mut self, new_obj: *mut Value, meta_updated: bool) {
        let o = as_tagged(new_obj);
        let vt = (*o).type_of();
        if vt.is_null() || vt as usize & 15 != 0 {
            self.corrupt_type_fail(new_obj);
        }
        let vt = &*vt;
        let bits = if gc_old((*o).header()) && !self.collector.mark_reset_age.get() {
            GC_OLD_MARKED
        } else {
            GC_MARKED
        };
        let mut update_meta = !meta_updated;
        if update_meta && self.collector.in_perm_region(o as usize) {
            // permanent image object: the tag is enough, there is no pool
            // or big metadata to touch; remember it for the full sweep
            self.perm_marked.push(o as usize);
            update_meta = false;
        }

        match &vt.desc {
            FieldDesc::None => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
            }
            FieldDesc::Ptr8(offsets) => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
                if offsets.is_empty() {
                    return;
                }
                let nptr = ((vt.npointers as usize) << 2) | (bits & GC_OLD);
                self.mark_obj8(new_obj, offsets, nptr);
            }
            FieldDesc::Ptr16(offsets) => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
                if offsets.is_empty() {
                    return;
                }
                let nptr = ((vt.npointers as usize) << 2) | (bits & GC_OLD);
                self.mark_obj16(new_obj, offsets, nptr);
            }
            FieldDesc::Ptr32(offsets) => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
                if offsets.is_empty() {
                    return;
                }
                let nptr = ((vt.npointers as usize) << 2) | (bits & GC_OLD);
                self.mark_obj32(new_obj, offsets, nptr);
            }
            FieldDesc::ObjVec => {
                let vec = new_obj.cast::<ObjVec>();
                let l = (*vec).len;
                let dtsz = l * WORD + std::mem::size_of::<ObjVec>();
                if update_meta {
                    self.setmark(o, bits, dtsz);
                }
                let begin = ObjVec::data(vec);
                let nptr = (l << 2) | (bits & GC_OLD);
                self.mark_objarray(new_obj, begin, begin.add(l), 1, nptr);
            }
            FieldDesc::String => {
                let dtsz = (*new_obj.cast::<GcString>()).len + WORD + 1;
                if update_meta {
                    self.setmark(o, bits, dtsz);
                }
            }
            FieldDesc::Weak => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
                // the referent is deliberately not scanned
            }
            FieldDesc::Array => {
                let a = new_obj.cast::<Array>();
                if update_meta {
                    // arrays may live in a pool or as big objects, decide by
                    // page lookup
                    let page = self
                        .collector
                        .page_alloc
                        .memory_map()
                        .page_metadata(o as usize);
                    if !page.is_null() {
                        self.setmark_pool_page(o, bits, page);
                    } else {
                        self.setmark_big(o, bits);
                    }
                }
                match (*a).how {
                    ARRAY_BUFFERED => {
                        self.setmark_buf((*a).data.cast(), bits, (*a).nbytes());
                    }
                    ARRAY_MALLOC => {
                        if update_meta {
                            if bits == GC_OLD_MARKED {
                                self.cache.perm_scanned_bytes += (*a).nbytes() as isize;
                            } else {
                                self.cache.scanned_bytes += (*a).nbytes() as isize;
                            }
                        }
                    }
                    ARRAY_OWNED => {
                        let owner = (*a).owner;
                        let mut nptr = (1 << 2) | (bits & GC_OLD);
                        self.try_claim_and_push(owner, Some(&mut nptr));
                        self.mark_push_remset(new_obj, nptr);
                        return;
                    }
                    _ => {}
                }
                if (*a).data.is_null() || (*a).len == 0 {
                    return;
                }
                let l = (*a).len;
                if (*a).ptrarray {
                    let begin = (*a).data.cast::<*mut Value>();
                    let nptr = (l << 2) | (bits & GC_OLD);
                    self.mark_objarray(new_obj, begin, begin.add(l), 1, nptr);
                } else if (*a).hasptr {
                    let et = (*a).eltype;
                    debug_assert!(!et.is_null());
                    let et = &*et;
                    let npointers = et.npointers as usize;
                    let elem_words = (*a).elsize as usize / WORD;
                    let begin = (*a).data.cast::<*mut Value>();
                    let end = begin.add(l * elem_words);
                    let nptr = ((l * npointers) << 2) | (bits & GC_OLD);
                    match &et.desc {
                        FieldDesc::Ptr8(offsets) if npointers == 1 => {
                            self.mark_objarray(
                                new_obj,
                                begin.add(offsets[0] as usize),
                                end,
                                elem_words,
                                nptr,
                            );
                        }
                        FieldDesc::Ptr8(offsets) => {
                            self.mark_array8(new_obj, begin, end, elem_words, offsets, nptr);
                        }
                        FieldDesc::Ptr16(offsets) => {
                            self.mark_array16(new_obj, begin, end, elem_words, offsets, nptr);
                        }
                        _ => self.corrupt_type_fail(new_obj),
                    }
                }
            }
            FieldDesc::Task { offsets } => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
                let ta = new_obj.cast::<Task>();
                if !self.collector.callbacks.task_scanner.is_empty() {
                    let is_root = self.collector.is_root_task(new_obj);
                    let me: *mut Marker = self;
                    self.collector
                        .callbacks
                        .task_scanner
                        .invoke(|cb| cb(unsafe { &mut *me }, new_obj, is_root));
                }
                let stkbuf = (*ta).stkbuf;
                if !stkbuf.is_null() {
                    self.setmark_buf(stkbuf, bits, (*ta).bufsz);
                }
                let s = (*ta).gcstack;
                if !s.is_null() {
                    self.mark_stack(s, 0, 0, usize::MAX);
                }
                if !(*ta).excstack.is_null() {
                    let excstack = (*ta).excstack.cast::<ExcStack>();
                    let itr = (*excstack).top;
                    self.setmark_buf(
                        (*ta).excstack,
                        bits,
                        std::mem::size_of::<ExcStack>() + WORD * (*excstack).reserved_size,
                    );
                    self.mark_excstack(excstack, itr);
                }
                // assume tasks always reference young objects
                let nptr = (offsets.len() << 2) | 1 | (bits & GC_OLD);
                self.mark_obj8(new_obj, offsets, nptr);
            }
            FieldDesc::Module => {
                if update_meta {
                    self.setmark(o, bits, std::mem::size_of::<Module>());
                }
                let m = new_obj.cast::<Module>();
                let nptr =
                    (((*m).bindings_size + (*m).usings_len + 1) << 2) | (bits & GC_OLD);
                self.mark_module_binding(new_obj, nptr, bits);
            }
            FieldDesc::Dynamic(markfunc) => {
                if update_meta {
                    self.setmark(o, bits, vt.size);
                }
                let old = (*o).bits() & GC_OLD != 0;
                let young = markfunc(self, new_obj);
                if old && young > 0 {
                    self.mark_push_remset(new_obj, young * 4 + 3);
                }
            }
        }
    }

    /// Drain this marker's queue.
    pub(crate) unsafe fn mark_loop(&mut self) {
        while let Some(new_obj) = self.pop() {
            self.mark_outrefs(new_obj, false);
        }
    }

    /// Parallel drain: exhaust the own deque, then steal from peers;
    /// terminate when every marker agrees the queues are empty.
    pub(crate) unsafe fn mark_loop_parallel(
        &mut self,
        id: usize,
        deques: &[WsDeque],
        terminator: &Terminator,
    ) {
        loop {
            while let Some(new_obj) = self.pop() {
                self.mark_outrefs(new_obj, false);
            }
            match self.try_steal(id, deques) {
                Some(new_obj) => {
                    self.mark_outrefs(new_obj, false);
                }
                None => {
                    if terminator.try_terminate() {
                        break;
                    }
                }
            }
        }
    }

    fn try_steal(&self, id: usize, deques: &[WsDeque]) -> Option<*mut Value> {
        let n = deques.len();
        for i in 1..n {
            let victim = &deques[(id + i) % n];
            loop {
                match victim.steal() {
                    Some(v) => return Some(v),
                    None if victim.is_empty() => break,
                    None => continue,
                }
            }
        }
        None
    }
}

/// Work-stealing termination protocol shared by the marker pool: a worker
/// that finds every queue empty votes to stop, and re-registers if more
/// work shows up before all votes are in.
pub(crate) struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }
        if self.decrease_workers() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);
        loop {
            if nworkers == 0 {
                return true;
            }
            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // workers didn't terminate in time, there is still work
                    return false;
                }
                Err(prev) => nworkers = prev,
            }
        }
    }
}

/// Rotate the remsets of a parked mutator and re-tag the previous cycle's
/// entries `OLD_MARKED` so they are not double counted.
pub(crate) unsafe fn gc_premark(m: *mut Mutator) {
    let heap = &mut (*m).heap;
    std::mem::swap(&mut heap.remset, &mut heap.last_remset);
    heap.remset.clear();
    heap.remset_nptr = 0;
    for &item in heap.last_remset.iter() {
        (*as_tagged(item)).set_bits(GC_OLD_MARKED);
    }
    for &b in heap.rem_bindings.iter() {
        (*as_tagged(b.cast())).set_bits(GC_OLD_MARKED);
    }
}

/// Queue the thread-local task roots of a parked mutator.
pub(crate) unsafe fn gc_queue_thread_local(marker: &mut Marker, m: *mut Mutator) {
    let m = &*m;
    for v in [
        m.current_task.get(),
        m.root_task.get(),
        m.next_task.get(),
        m.previous_task.get(),
        m.previous_exception.get(),
    ] {
        if !v.is_null() {
            marker.try_claim_and_push(v, None);
        }
    }
    if !m.gcstack.get().is_null() {
        marker.mark_stack(m.gcstack.get(), 0, 0, usize::MAX);
    }
}

/// Queue managed values stashed in the backtrace buffer.
pub(crate) unsafe fn gc_queue_bt_buf(marker: &mut Marker, m: *mut Mutator) {
    for &e in (*m).bt_buf.iter() {
        if e != 0 && e & 1 == 0 {
            marker.try_claim_and_push(e as *mut Value, None);
        }
    }
}

/// Re-scan the previous remset of a parked mutator. Entries are already
/// marked, so they go straight to `mark_outrefs`; surviving bindings that
/// still reference young values are compacted in place.
pub(crate) unsafe fn gc_queue_remset(marker: &mut Marker, m: *mut Mutator) {
    let heap = &mut (*m).heap;
    for i in 0..heap.last_remset.len() {
        let item = heap.last_remset[i];
        marker.mark_outrefs(item, true);
    }
    let mut n_bnd_refyoung = 0;
    for i in 0..heap.rem_bindings.len() {
        let b = heap.rem_bindings[i];
        let v = (*b).value.load(Ordering::Relaxed);
        if !v.is_null() {
            marker.try_claim_and_push(v, None);
            if !gc_old((*as_tagged(v)).header()) {
                heap.rem_bindings[n_bnd_refyoung] = b;
                n_bnd_refyoung += 1;
            }
        }
    }
    heap.rem_bindings.truncate(n_bnd_refyoung);
}

impl Mutator {
    /// Write barrier: an old object was stored a pointer to a young one.
    /// Re-tags the parent `MARKED` and remembers it. The header update is
    /// not atomic: the collector cannot run here, and nothing else writes
    /// the GC bits outside a collection; a duplicated remset entry is
    /// harmless.
    pub fn queue_root(&mut self, ptr: *mut Value) {
        unsafe {
            (*as_tagged(ptr)).set_bits(GC_MARKED);
        }
        self.heap.remset.push(ptr);
        self.heap.remset_nptr += 1; // conservative
    }

    /// Barrier for a store of compound value `ptr` into old `parent`:
    /// only fires the full barrier when `ptr` actually carries a young
    /// reference in one of its pointer fields.
    pub fn queue_multiroot(&mut self, parent: *mut Value, ptr: *mut Value) {
        unsafe {
            let vt = (*as_tagged(ptr)).type_of();
            let slots = ptr as *mut *mut Value;
            let check = |off: usize| -> bool {
                unsafe {
                    let child = slots.add(off).read();
                    !child.is_null() && (*as_tagged(child)).bits() & GC_MARKED == 0
                }
            };
            match &(*vt).desc {
                FieldDesc::Ptr8(offsets) => {
                    for &off in offsets.iter() {
                        if check(off as usize) {
                            self.queue_root(parent);
                            return;
                        }
                    }
                }
                FieldDesc::Ptr16(offsets) => {
                    for &off in offsets.iter() {
                        if check(off as usize) {
                            self.queue_root(parent);
                            return;
                        }
                    }
                }
                FieldDesc::Ptr32(offsets) => {
                    for &off in offsets.iter() {
                        if check(off as usize) {
                            self.queue_root(parent);
                            return;
                        }
                    }
                }
                // no cheap field map; be conservative
                _ => self.queue_root(parent),
            }
        }
    }

    /// Specialized barrier for name bindings.
    pub fn queue_binding(&mut self, b: *mut crate::types::Binding) {
        unsafe {
            (*as_tagged(b.cast())).set_bits(GC_MARKED);
        }
        self.heap.rem_bindings.push(b);
    }

    /// Force-promote `v` to the old generation, preserving the barrier
    /// invariant by remembering it when it has pointer fields.
    pub fn force_mark_old(&mut self, v: *mut Value) {
        unsafe {
            let o = as_tagged(v);
            if (*o).bits() == GC_OLD_MARKED {
                return;
            }
            (*o).set_bits(GC_OLD_MARKED);
            let vt = (*o).type_of();
            if !vt.is_null() && (*vt).npointers != 0 {
                self.queue_root(v);
            }
        }
    }
}

/// Queue the registered global root slots.
pub(crate) unsafe fn gc_mark_roots(marker: &mut Marker) {
    for i in 0..marker.collector.global_roots.len() {
        let slot = marker.collector.global_roots[i];
        let v = slot.read();
        if !v.is_null() {
            marker.try_claim_and_push(v, None);
        }
    }
}

/// Seed the deques round-robin and drain them on the marker pool.
pub(crate) unsafe fn gc_mark_loop_parallel(
    collector: &Collector,
    master: *mut Mutator,
    queue: &mut MarkQueue,
    pool: &mut scoped_threadpool::Pool,
) {
    let nworkers = pool.thread_count() as usize;
    let deques: Vec<WsDeque> = (0..nworkers).map(|_| WsDeque::new()).collect();
    {
        let mut i = 0;
        queue.drain_into(|obj| {
            deques[i % nworkers].push(obj);
            i += 1;
        });
    }
    let terminator = Terminator::new(nworkers);
    let collector_addr = collector as *const Collector as usize;
    let master_addr = master as usize;
    pool.scoped(|scoped| {
        for id in 0..nworkers {
            let deques = &deques;
            let terminator = &terminator;
            scoped.execute(move || unsafe {
                let collector = &*(collector_addr as *const Collector);
                let master = master_addr as *mut Mutator;
                let mut marker = Marker::with_deque(collector, master, &deques[id]);
                marker.mark_loop_parallel(id, deques, terminator);
                marker.sync_cache();
                marker.flush_remset();
            });
        }
    });
}
