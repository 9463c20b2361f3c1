//! Sweep phase. Runs single threaded while the world is stopped, in the
//! order driven by the controller: weak refs, task stacks, foreign
//! objects, malloc'd arrays, big objects, pool pages, permanent image
//! tags.

use std::ptr::null_mut;
use std::sync::atomic::Ordering;

use crate::alloc::{aligned, gc_reset_page};
use crate::collect::Collector;
use crate::heap::Pool;
use crate::mutator::Mutator;
use crate::page::{
    gc_page_data, PageMeta, PageTable0, PageTable1, GC_PAGE_OFFSET, GC_PAGE_SZ, NO_FREELIST,
};
use crate::size_classes::N_POOLS;
use crate::types::{Array, ARRAY_MALLOC};
use crate::value::{
    as_tagged, gc_marked, BigVal, TaggedValue, Value, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED,
    PROMOTE_AGE,
};

/// Null out the referents of weak references whose targets died this
/// cycle. Runs right after marking, before any memory is released.
pub(crate) unsafe fn gc_clear_weak_refs(collector: &Collector) {
    let undef = collector.undef();
    for &m in collector.mutators.iter() {
        for &wr in (*m).heap.weak_refs.iter() {
            let value = &mut (*wr.cast::<crate::value::WeakRef>()).value;
            if *value != undef && !gc_marked((*as_tagged(*value)).bits()) {
                *value = undef;
            }
        }
    }
}

/// Drop weak reference objects that themselves died.
pub(crate) unsafe fn gc_sweep_weak_refs(collector: &Collector) {
    for &m in collector.mutators.iter() {
        (*m).heap
            .weak_refs
            .retain(|&wr| unsafe { gc_marked((*as_tagged(wr)).bits()) });
    }
}

/// Dispatch the layout sweep hook for dead objects that opted in, and
/// compact the scheduling lists.
pub(crate) unsafe fn gc_sweep_foreign_objs(collector: &Collector) {
    for &m in collector.mutators.iter() {
        (*m).sweep_objs.retain(|&v| unsafe {
            if gc_marked((*as_tagged(v)).bits()) {
                return true;
            }
            let vt = (*as_tagged(v)).type_of();
            if let Some(sweepfunc) = (*vt).sweepfunc {
                sweepfunc(v);
            }
            false
        });
    }
}

/// Free the buffers of unmarked malloc-backed arrays and recycle the
/// tracking nodes.
pub(crate) unsafe fn gc_sweep_malloced_arrays(collector: &mut Collector) {
    for i in 0..collector.mutators.len() {
        let m = collector.mutators[i];
        let heap = &mut (*m).heap;
        let mut ma = heap.mallocarrays;
        let mut pma = &mut heap.mallocarrays as *mut *mut crate::heap::MallocArray;
        while !ma.is_null() {
            let nxt = (*ma).next;
            let bits = (*as_tagged((*ma).a)).bits();
            if gc_marked(bits) {
                pma = &mut (*ma).next;
            } else {
                *pma = nxt;
                let a = (*ma).a.cast::<Array>();
                debug_assert!((*a).how == ARRAY_MALLOC);
                gc_free_array(collector, a);
                (*ma).next = heap.mafreelist;
                heap.mafreelist = ma;
            }
            ma = nxt;
        }
    }
}

unsafe fn gc_free_array(collector: &mut Collector, a: *mut Array) {
    if (*a).how == ARRAY_MALLOC {
        let nbytes = (*a).nbytes();
        let allocsz = crate::utils::align_up(nbytes, crate::value::CACHE_BYTE_ALIGNMENT);
        aligned::free_aligned((*a).data, allocsz);
        collector.gc_num.freed += nbytes as i64;
        collector.gc_num.freecall += 1;
    }
}

/// Sweep the big list rooted at `*pv`, removing and freeing unmarked
/// entries. Returns the last `next` slot of the culled list.
pub(crate) unsafe fn gc_sweep_big_list(
    collector: &mut Collector,
    sweep_full: bool,
    mut pv: *mut *mut BigVal,
) -> *mut *mut BigVal {
    let mut v = *pv;
    while !v.is_null() {
        let nxt = (*v).next;
        let bits = (*(*v).tagged()).bits();
        if gc_marked(bits) {
            pv = &mut (*v).next;
            let age = (*v).age();
            let mut bits = bits;
            if age >= PROMOTE_AGE || bits == GC_OLD_MARKED {
                if sweep_full || bits == GC_MARKED {
                    bits = GC_OLD;
                }
            } else {
                (*v).inc_age();
                bits = GC_CLEAN;
            }
            (*(*v).tagged()).set_bits(bits);
        } else {
            // remove from the list and free
            *pv = nxt;
            if !nxt.is_null() {
                (*nxt).prev = pv;
            }
            let sz = (*v).size();
            collector.gc_num.freed += sz as i64;
            collector.callbacks.notify_external_free.invoke(|cb| cb(v));
            aligned::free_aligned(v.cast(), sz);
        }
        v = nxt;
    }
    pv
}

/// Sweep every mutator's big list; on a full sweep, merge the surviving
/// `big_objects_marked` entries back into the collecting mutator's list.
pub(crate) unsafe fn gc_sweep_big(collector: &mut Collector, master: *mut Mutator, sweep_full: bool) {
    for i in 0..collector.mutators.len() {
        let m = collector.mutators[i];
        let list = &mut (*m).heap.big_objects as *mut *mut BigVal;
        gc_sweep_big_list(collector, sweep_full, list);
    }
    if sweep_full {
        let marked = collector.big_objects_marked.get();
        let last_next = gc_sweep_big_list(collector, sweep_full, marked);
        // move all survivors to the master's live list
        let big_objects = &mut (*master).heap.big_objects;
        if !big_objects.is_null() {
            (**big_objects).prev = last_next;
        }
        *last_next = *big_objects;
        *big_objects = *marked;
        if !big_objects.is_null() {
            (**big_objects).prev = big_objects;
        }
        *marked = null_mut();
    }
}

/// Demote the permanent-image tags recorded during marking so a later
/// full mark can traverse them again.
pub(crate) unsafe fn gc_sweep_perm_alloc(collector: &mut Collector) {
    let list = &mut *collector.perm_marked.get();
    for &o in list.iter() {
        (*(o as *mut TaggedValue)).set_bits(GC_OLD);
    }
    list.clear();
}

/// Recount the free cells of the page the freelist currently points into;
/// its `nfree` went stale while the pool allocated from it.
unsafe fn gc_pool_sync_nfree(pg: *mut PageMeta, mut last: *mut TaggedValue) {
    debug_assert!((*pg).fl_begin_offset != NO_FREELIST);
    let cur_pg = gc_page_data(last as usize);
    // fast path: nothing was allocated from the freelist
    let fl_beg = (cur_pg as usize + (*pg).fl_begin_offset as usize) as *mut TaggedValue;
    if last == fl_beg {
        return;
    }
    let mut nfree = 0u16;
    loop {
        nfree += 1;
        last = (*last).next();
        if gc_page_data(last as usize) != cur_pg {
            break;
        }
    }
    (*pg).nfree = nfree;
}

/// Sweep one page. `pfl` is the tail slot of the owning pool's freelist
/// under construction; the return value is the new tail. Cells are
/// threaded onto the freelist in address order, pages of one pool chain
/// through it in sweep order.
unsafe fn gc_sweep_page(
    collector: &mut Collector,
    pool: *mut Pool,
    pg: *mut PageMeta,
    mut pfl: *mut *mut TaggedValue,
    sweep_full: bool,
) -> *mut *mut TaggedValue {
    let osize = (*pg).osize as usize;
    let data = (*pg).data;
    let old_nfree = (*pg).nfree as i64;
    let nfree;

    if (*pg).has_marked.load(Ordering::Relaxed) == 0 {
        // no live cells: reclaim the whole page. On quick sweeps keep a
        // bounded number of empty pages allocated and threaded back into
        // the bump chain, so hot allocation sites don't bounce pages
        // against the OS.
        let lazy_cap = (crate::collect::default_collect_interval() / GC_PAGE_SZ) as i64;
        if !sweep_full && collector.lazy_freed_pages <= lazy_cap {
            let begin = gc_reset_page((*pg).pool_n as usize, (*pg).thread_n, pg, (*pool).newpages);
            (*pool).newpages = begin;
            (*begin).set_next(null_mut());
            collector.lazy_freed_pages += 1;
        } else {
            collector.page_alloc.free_page(pg);
        }
        nfree = ((GC_PAGE_SZ - GC_PAGE_OFFSET) / osize) as i64;
        collector.gc_num.freed += (nfree - old_nfree) * osize as i64;
        return pfl;
    }

    if !sweep_full && (*pg).has_young.load(Ordering::Relaxed) == 0 {
        // quick sweep, no young cells: the page contents cannot have
        // changed unless an old cell died, which `nold` tracks
        debug_assert!(
            !collector.prev_sweep_full
                || (*pg).prev_nold >= (*pg).nold.load(Ordering::Relaxed)
        );
        if !collector.prev_sweep_full || (*pg).prev_nold == (*pg).nold.load(Ordering::Relaxed) {
            // hook the page's recorded freelist segment in unchanged
            if (*pg).fl_begin_offset != NO_FREELIST {
                *pfl = (data as usize + (*pg).fl_begin_offset as usize) as *mut TaggedValue;
                pfl = (data as usize + (*pg).fl_end_offset as usize) as *mut *mut TaggedValue;
            }
            return pfl;
        }
    }

    // walk every cell, rebuilding the freelist and the age bits
    let lim = data as usize + GC_PAGE_SZ - osize;
    let mut v = (data as usize + GC_PAGE_OFFSET) as *mut TaggedValue;
    let mut has_marked = false;
    let mut has_young = false;
    let mut prev_nold: u16 = 0;
    let mut pg_nfree: i64 = 0;
    let mut pfl_begin: *mut *mut TaggedValue = null_mut();
    let mut ages = (*pg).ages;
    let mut msk: u8 = 1;
    while v as usize <= lim {
        let mut bits = (*v).bits();
        if !gc_marked(bits) {
            *pfl = v;
            pfl = v.cast();
            if pfl_begin.is_null() {
                pfl_begin = pfl;
            }
            pg_nfree += 1;
            *ages &= !msk;
        } else {
            // marked young or old
            if *ages & msk != 0 || bits == GC_OLD_MARKED {
                // old enough; `!age && OLD_MARKED` happens for cells
                // promoted through the write barrier
                if sweep_full || bits == GC_MARKED {
                    bits = GC_OLD; // promote
                    (*v).set_bits(bits);
                }
                prev_nold += 1;
            } else {
                debug_assert!(bits == GC_MARKED);
                bits = GC_CLEAN; // young survivor, stays young
                (*v).set_bits(bits);
                has_young = true;
            }
            if gc_marked(bits) {
                has_marked = true;
            }
            *ages |= msk;
        }
        v = (v as usize + osize) as *mut TaggedValue;
        msk = msk.rotate_left(1);
        if msk == 1 {
            ages = ages.add(1);
        }
    }

    (*pg).has_marked
        .store(has_marked as u8, Ordering::Relaxed);
    (*pg).has_young.store(has_young as u8, Ordering::Relaxed);
    if !pfl_begin.is_null() {
        (*pg).fl_begin_offset = (pfl_begin as usize - data as usize) as u16;
        (*pg).fl_end_offset = (pfl as usize - data as usize) as u16;
    } else {
        (*pg).fl_begin_offset = NO_FREELIST;
        (*pg).fl_end_offset = NO_FREELIST;
    }
    (*pg).nfree = pg_nfree as u16;
    if sweep_full {
        (*pg).nold.store(0, Ordering::Relaxed);
        (*pg).prev_nold = prev_nold;
    }
    collector.gc_num.freed += (pg_nfree - old_nfree) * osize as i64;
    pfl
}

unsafe fn gc_sweep_pool_page(
    collector: &mut Collector,
    pfl: &mut [*mut *mut TaggedValue],
    pg: *mut PageMeta,
    sweep_full: bool,
) {
    let t = (*pg).thread_n as usize;
    let pool_n = (*pg).pool_n as usize;
    let m = collector.mutators[t];
    let pool = &mut (*m).heap.pools[pool_n] as *mut Pool;
    let i = t * N_POOLS + pool_n;
    pfl[i] = gc_sweep_page(collector, pool, pg, pfl[i], sweep_full);
}

/// Sweep a leaf table; returns whether any allocated page remains.
unsafe fn gc_sweep_pool_pagetable0(
    collector: &mut Collector,
    pfl: &mut [*mut *mut TaggedValue],
    t0: *mut PageTable0,
    sweep_full: bool,
) -> bool {
    let mut any = false;
    let lb = (*t0).lb.load(Ordering::Relaxed).max(0);
    let ub = (*t0).ub.load(Ordering::Relaxed);
    let mut new_ub = 0;
    for i32idx in lb..=ub {
        let mut line = (*t0).allocmap[i32idx as usize].load(Ordering::Relaxed);
        if line == 0 {
            continue;
        }
        any = true;
        new_ub = i32idx;
        while line != 0 {
            let j = line.trailing_zeros() as usize;
            line &= line - 1;
            let pg = (*t0).meta[i32idx as usize * 32 + j].load(Ordering::Relaxed);
            debug_assert!(!pg.is_null());
            gc_sweep_pool_page(collector, pfl, pg, sweep_full);
        }
    }
    (*t0).ub.store(new_ub, Ordering::Relaxed);
    any
}

unsafe fn gc_sweep_pool_pagetable1(
    collector: &mut Collector,
    pfl: &mut [*mut *mut TaggedValue],
    t1: *mut PageTable1,
    sweep_full: bool,
) -> bool {
    let mut any = false;
    let lb = (*t1).lb.load(Ordering::Relaxed).max(0);
    let ub = (*t1).ub.load(Ordering::Relaxed);
    let mut new_ub = 0;
    for i32idx in lb..=ub {
        let mut line = (*t1).allocmap0[i32idx as usize].load(Ordering::Relaxed);
        if line == 0 {
            continue;
        }
        while line != 0 {
            let j = line.trailing_zeros() as usize;
            line &= line - 1;
            let idx = i32idx as usize * 32 + j;
            let t0 = (*t1).meta0[idx].load(Ordering::Relaxed);
            debug_assert!(!t0.is_null());
            if gc_sweep_pool_pagetable0(collector, pfl, t0, sweep_full) {
                any = true;
                new_ub = i32idx;
            } else {
                // subtree is empty now, prune it from future sweeps
                (*t1).allocmap0[i32idx as usize]
                    .fetch_and(!(1u32 << j), Ordering::Relaxed);
            }
        }
    }
    (*t1).ub.store(new_ub, Ordering::Relaxed);
    any
}

unsafe fn gc_sweep_pool_pagetable(
    collector: &mut Collector,
    pfl: &mut [*mut *mut TaggedValue],
    sweep_full: bool,
) {
    let mm = collector.page_alloc.memory_map;
    let lb = (*mm).lb.load(Ordering::Relaxed).max(0);
    let ub = (*mm).ub.load(Ordering::Relaxed);
    let mut new_ub = 0;
    for i32idx in lb..=ub {
        let mut line = (*mm).allocmap1[i32idx as usize].load(Ordering::Relaxed);
        if line == 0 {
            continue;
        }
        while line != 0 {
            let j = line.trailing_zeros() as usize;
            line &= line - 1;
            let idx = i32idx as usize * 32 + j;
            let t1 = (*mm).meta1[idx].load(Ordering::Relaxed);
            debug_assert!(!t1.is_null());
            if gc_sweep_pool_pagetable1(collector, pfl, t1, sweep_full) {
                new_ub = i32idx;
            } else {
                (*mm).allocmap1[i32idx as usize].fetch_and(!(1u32 << j), Ordering::Relaxed);
            }
        }
    }
    (*mm).ub.store(new_ub, Ordering::Relaxed);
}

/// The pool sweep: settle the allocation-target pages, walk every
/// allocated page through the page table, then terminate the rebuilt
/// freelists.
pub(crate) unsafe fn gc_sweep_pool(collector: &mut Collector, sweep_full: bool) {
    collector.lazy_freed_pages = 0;

    let n_threads = collector.mutators.len();
    let mut pfl: Vec<*mut *mut TaggedValue> = vec![null_mut(); n_threads * N_POOLS];

    // update the metadata of the pages the pools are currently allocating
    // from; their nfree went stale on the fast path
    for t_i in 0..n_threads {
        let m = collector.mutators[t_i];
        for i in 0..N_POOLS {
            let p = &mut (*m).heap.pools[i];
            let last = p.freelist;
            if !last.is_null() {
                let pg = (*collector.page_alloc.memory_map).page_metadata(last as usize);
                debug_assert!(!pg.is_null());
                gc_pool_sync_nfree(pg, last);
                (*pg).has_young.store(1, Ordering::Relaxed);
            }
            p.freelist = null_mut();
            pfl[t_i * N_POOLS + i] = &mut p.freelist;

            let last = p.newpages;
            if !last.is_null() {
                let pg = (*collector.page_alloc.memory_map).page_metadata(last as usize - 1);
                debug_assert!(!pg.is_null());
                let page_start = gc_page_data(last as usize - 1) as usize;
                (*pg).nfree =
                    ((GC_PAGE_SZ - (last as usize - page_start)) / p.osize as usize) as u16;
                (*pg).has_young.store(1, Ordering::Relaxed);
            }
            p.newpages = null_mut();
        }
    }

    gc_sweep_pool_pagetable(collector, &mut pfl, sweep_full);

    // null out the terminal pointers of the rebuilt freelists
    for tail in pfl {
        *tail = null_mut();
    }
}

/// Find the live-object base for an interior pointer, pool pages only.
/// Three cases: full page, current bump page, freelist page (decided via
/// `nfree`, the freelist offsets and the age bits).
pub(crate) unsafe fn gc_internal_obj_base_ptr(
    collector: &Collector,
    p: usize,
) -> Option<*mut Value> {
    let p = p.wrapping_sub(1);
    let meta = (*collector.page_alloc.memory_map).page_metadata_allocd(p);
    if meta.is_null() || (*meta).ages.is_null() {
        return None;
    }
    let page = gc_page_data(p) as usize;
    let off = p - page;
    if off < GC_PAGE_OFFSET {
        return None;
    }
    let off2 = (off - GC_PAGE_OFFSET) % (*meta).osize as usize;
    let osize = (*meta).osize as usize;
    if off - off2 + osize > GC_PAGE_SZ {
        return None;
    }
    let cell = (p - off2) as *mut TaggedValue;
    let m = collector.mutators[(*meta).thread_n as usize];
    let pool = &(*m).heap.pools[(*meta).pool_n as usize];

    let valid = 'found: {
        if (*meta).nfree == 0 {
            // full page: every cell is an object
            break 'found true;
        }
        if (*meta).fl_begin_offset == NO_FREELIST {
            // a page on the newpages chain. Only the first page of the
            // chain is ever allocated from (reset_page inserts behind it),
            // everything else is empty.
            let newpages = pool.newpages;
            if newpages.is_null() {
                break 'found false;
            }
            if gc_page_data(newpages as usize) as usize != page {
                break 'found false;
            }
            // bump page: anything below the cursor is an object
            break 'found (cell as usize) < newpages as usize;
        }
        // freelist page: marked or old cells can't be on the freelist
        if (*cell).bits() != 0 {
            break 'found true;
        }
        // freelist entries are consumed in address order: anything below
        // the freelist cursor in the same page was allocated after the
        // last sweep
        let fl = pool.freelist;
        if !fl.is_null()
            && gc_page_data(cell as usize) == gc_page_data(fl as usize)
            && (cell as usize) < fl as usize
        {
            break 'found true;
        }
        // otherwise the age bit still reflects the last sweep: zero for
        // freelist entries, one for live objects
        let obj_id = (off - off2) / osize;
        (*meta).ages.add(obj_id / 8).read() & (1 << (obj_id % 8)) != 0
    };
    if valid {
        Some(crate::value::value_of(cell))
    } else {
        None
    }
}
