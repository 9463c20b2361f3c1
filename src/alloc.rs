//! Allocation paths: size-class pools, big objects, counted malloc
//! wrappers for array buffers, string reallocation and the permanent
//! arena.

use std::mem::size_of;
use std::ptr::null_mut;

use atomic::Ordering;
use parking_lot::lock_api::RawMutex;

use crate::collect::Collector;
use crate::error::GcError;
use crate::heap::MallocArray;
use crate::mutator::Mutator;
use crate::page::{gc_page_data, PageMeta, GC_PAGE_OFFSET, GC_PAGE_SZ, NO_FREELIST};
use crate::size_classes::{size_class_index, GC_MAX_SZCLASS};
use crate::types::{Array, TypeLayout, STRING_LAYOUT, WEAK_REF_LAYOUT};
use crate::value::GcString;
use crate::utils::checked_align_up;
use crate::value::{
    as_tagged, gc_marked, value_of, BigVal, TaggedValue, Value, WeakRef, CACHE_BYTE_ALIGNMENT,
    GC_OLD, PROMOTE_AGE, WORD,
};

/// Aligned malloc wrappers for cache-line aligned blocks.
pub(crate) mod aligned {
    use std::alloc::{alloc, dealloc, realloc, Layout};

    use crate::value::CACHE_BYTE_ALIGNMENT;

    #[inline]
    fn layout(sz: usize) -> Layout {
        Layout::from_size_align(sz, CACHE_BYTE_ALIGNMENT).unwrap()
    }

    pub unsafe fn malloc_cache_align(sz: usize) -> *mut u8 {
        alloc(layout(sz))
    }

    pub unsafe fn realloc_cache_align(p: *mut u8, sz: usize, oldsz: usize) -> *mut u8 {
        realloc(p, layout(oldsz), sz)
    }

    pub unsafe fn free_aligned(p: *mut u8, sz: usize) {
        dealloc(p, layout(sz));
    }
}

/// Thread a recycled or fresh page into `fl`'s bump chain and reset its
/// metadata. Returns the new bump cursor.
///
/// A recycled page is inserted *after* the first page of the chain, so
/// objects only ever bump-allocate from one page at a time. The
/// conservative base-pointer lookup relies on this.
pub(crate) unsafe fn gc_reset_page(
    pool_n: usize,
    thread_n: u16,
    pg: *mut PageMeta,
    fl: *mut TaggedValue,
) -> *mut TaggedValue {
    debug_assert!(GC_PAGE_OFFSET >= size_of::<*mut u8>());
    let osize = (*pg).osize as usize;
    (*pg).nfree = ((GC_PAGE_SZ - GC_PAGE_OFFSET) / osize) as u16;
    (*pg).pool_n = pool_n as u8;
    (*pg).thread_n = thread_n;
    std::ptr::write_bytes((*pg).ages, 0, PageMeta::ages_len(osize));
    let mut beg = ((*pg).data as usize + GC_PAGE_OFFSET) as *mut TaggedValue;
    let next = (*pg).data as *mut TaggedValue;
    if fl.is_null() {
        (*next).set_next(null_mut());
    } else {
        let flpage = gc_page_data(fl as usize) as *mut TaggedValue;
        (*next).set_next((*flpage).next());
        (*flpage).set_next(beg);
        beg = fl;
    }
    (*pg).has_young.store(0, Ordering::Relaxed);
    (*pg).has_marked.store(0, Ordering::Relaxed);
    (*pg).fl_begin_offset = NO_FREELIST;
    (*pg).fl_end_offset = NO_FREELIST;
    beg
}

/// Bitmap bytes for the smallest size class; allocating the worst case
/// once lets a page move between pools without reallocating its ages.
fn ages_capacity() -> usize {
    PageMeta::ages_len(8)
}

impl Mutator {
    /// Dispatching allocation entry point: pools below `GC_MAX_SZCLASS`,
    /// big objects above. The header is initialized to `ty`; pool objects
    /// are born `CLEAN`, big objects `OLD`.
    #[inline]
    pub fn alloc(&mut self, sz: usize, ty: *const TypeLayout) -> Result<*mut Value, GcError> {
        let allocsz = sz.checked_add(size_of::<TaggedValue>()).ok_or(GcError::SizeOverflow)?;
        // the header store replaces whatever freelist linkage or stale tag
        // the cell carried; pool objects are born CLEAN, big objects OLD
        if sz <= GC_MAX_SZCLASS {
            let v = self.pool_alloc(size_class_index(allocsz))?;
            unsafe {
                (*as_tagged(v)).set_header(ty as usize);
            }
            Ok(v)
        } else {
            let v = self.big_alloc(allocsz)?;
            unsafe {
                (*as_tagged(v)).set_header(ty as usize | GC_OLD);
            }
            Ok(v)
        }
    }

    /// Allocate one cell from pool `pool_i`. The returned header holds the
    /// freelist linkage of the cell; the caller is responsible for setting
    /// the tag.
    pub fn pool_alloc(&mut self, pool_i: usize) -> Result<*mut Value, GcError> {
        self.maybe_collect();
        let osize = self.heap.pools[pool_i].osize as usize;
        self.count_alloc(osize);
        self.gc_num.poolalloc.fetch_add(1, Ordering::Relaxed);

        let memory_map = self.collector_ref().page_alloc.memory_map;
        unsafe {
            // fast path: freelist pop
            let v = self.heap.pools[pool_i].freelist;
            if !v.is_null() {
                let next = (*v).next();
                self.heap.pools[pool_i].freelist = next;
                if gc_page_data(v as usize) != gc_page_data(next as usize) {
                    // we only touch the page metadata when the freelist
                    // leaves the page: it is likely not in cache
                    let pg = (*memory_map).page_metadata(v as usize);
                    debug_assert!(!pg.is_null() && (*pg).osize as usize == osize);
                    (*pg).nfree = 0;
                    (*pg).has_young.store(1, Ordering::Relaxed);
                }
                return Ok(value_of(v));
            }

            // bump into the current fresh page
            let mut v = self.heap.pools[pool_i].newpages;
            if !v.is_null() {
                let cur_page = gc_page_data(v as usize - 1) as usize;
                if cur_page + GC_PAGE_SZ < v as usize + osize {
                    // page exhausted: mark it full and pop the next page off
                    // the chain threaded through the page's first word
                    let pg = (*memory_map).page_metadata(v as usize - 1);
                    debug_assert!(!pg.is_null() && (*pg).osize as usize == osize);
                    (*pg).nfree = 0;
                    (*pg).has_young.store(1, Ordering::Relaxed);
                    v = (*(cur_page as *mut TaggedValue)).next();
                }
            }
            if v.is_null() {
                v = self.add_page(pool_i)?;
            }
            self.heap.pools[pool_i].newpages = (v as usize + osize) as *mut TaggedValue;
            Ok(value_of(v))
        }
    }

    /// Request a page from the page allocator and make it the pool's bump
    /// target. Discards nothing: any previous `newpages` chain was already
    /// exhausted.
    #[cold]
    fn add_page(&mut self, pool_i: usize) -> Result<*mut TaggedValue, GcError> {
        let collector = self.collector_ref();
        let pg = collector.page_alloc.alloc_page()?;
        unsafe {
            (*pg).osize = self.heap.pools[pool_i].osize as u16;
            if (*pg).ages.is_null() {
                (*pg).ages = Box::leak(vec![0u8; ages_capacity()].into_boxed_slice()).as_mut_ptr();
            }
            let fl = gc_reset_page(pool_i, self.tid, pg, null_mut());
            self.heap.pools[pool_i].newpages = fl;
            Ok(fl)
        }
    }

    /// Allocate a big object. `sz` includes the tag word. Big objects are
    /// born old so quick sweeps never walk them twice.
    pub fn big_alloc(&mut self, sz: usize) -> Result<*mut Value, GcError> {
        self.maybe_collect();
        debug_assert!(sz >= size_of::<TaggedValue>());
        let offs = size_of::<BigVal>() - WORD;
        let allocsz = sz
            .checked_add(offs)
            .and_then(|s| checked_align_up(s, CACHE_BYTE_ALIGNMENT))
            .ok_or(GcError::SizeOverflow)?;
        unsafe {
            let v = aligned::malloc_cache_align(allocsz).cast::<BigVal>();
            if v.is_null() {
                return Err(GcError::OutOfMemory);
            }
            let collector = self.collector_ref();
            collector
                .callbacks
                .notify_external_alloc
                .invoke(|cb| cb(v, allocsz));
            self.count_alloc(allocsz);
            self.gc_num.bigalloc.fetch_add(1, Ordering::Relaxed);
            (*v).set_size_age(allocsz, PROMOTE_AGE);
            (*v).header.set_header(GC_OLD);
            BigVal::link(v, &mut self.heap.big_objects);
            Ok(value_of((*v).tagged()))
        }
    }

    /// Allocate a weak reference to `value`.
    pub fn alloc_weakref(&mut self, value: *mut Value) -> Result<*mut Value, GcError> {
        let wr = self.alloc(size_of::<WeakRef>(), &WEAK_REF_LAYOUT)?;
        unsafe {
            (*wr.cast::<WeakRef>()).value = value; // no barrier needed here
        }
        self.heap.weak_refs.push(wr);
        Ok(wr)
    }

    /// Allocate an uninitialized string of `len` bytes.
    pub fn alloc_string(&mut self, len: usize) -> Result<*mut Value, GcError> {
        let sz = len
            .checked_add(size_of::<usize>() + 1)
            .ok_or(GcError::SizeOverflow)?;
        let s = self.alloc(sz, &STRING_LAYOUT)?;
        unsafe {
            (*s.cast::<GcString>()).len = len;
            // NUL terminate like C strings so embedders can hand the data out
            s.cast::<u8>().add(size_of::<usize>() + len).write(0);
        }
        Ok(s)
    }

    /// Counted malloc for external array buffers. The caller must link the
    /// owning array with `track_malloced_array` or the buffer will never be
    /// freed.
    pub fn managed_malloc(&mut self, sz: usize) -> Result<*mut u8, GcError> {
        self.maybe_collect();
        let allocsz = checked_align_up(sz, CACHE_BYTE_ALIGNMENT).ok_or(GcError::SizeOverflow)?;
        self.count_alloc(allocsz);
        self.gc_num.malloc.fetch_add(1, Ordering::Relaxed);
        let b = unsafe { aligned::malloc_cache_align(allocsz) };
        if b.is_null() {
            return Err(GcError::OutOfMemory);
        }
        Ok(b)
    }

    /// Counted free for buffers obtained from `managed_malloc`.
    pub fn managed_free(&mut self, p: *mut u8, sz: usize) {
        let allocsz = checked_align_up(sz, CACHE_BYTE_ALIGNMENT).unwrap_or(sz);
        unsafe {
            aligned::free_aligned(p, allocsz);
        }
        self.gc_num.freed.fetch_add(allocsz as i64, Ordering::Relaxed);
        self.gc_num.freecall.fetch_add(1, Ordering::Relaxed);
    }

    /// Counted realloc. `owner` is the array object the buffer belongs to;
    /// old-marked owners account the growth against the old generation.
    pub fn managed_realloc(
        &mut self,
        d: *mut u8,
        sz: usize,
        oldsz: usize,
        owner: *mut Value,
    ) -> Result<*mut u8, GcError> {
        self.managed_realloc_(d, sz, oldsz, owner, true)
    }

    fn managed_realloc_(
        &mut self,
        d: *mut u8,
        sz: usize,
        oldsz: usize,
        owner: *mut Value,
        can_collect: bool,
    ) -> Result<*mut u8, GcError> {
        if can_collect {
            self.maybe_collect();
        }
        let allocsz = checked_align_up(sz, CACHE_BYTE_ALIGNMENT).ok_or(GcError::SizeOverflow)?;
        let oldallocsz = checked_align_up(oldsz, CACHE_BYTE_ALIGNMENT).unwrap();
        unsafe {
            if (*as_tagged(owner)).bits() == crate::value::GC_OLD_MARKED {
                let collector = self.collector_ref();
                collector
                    .perm_scanned_bytes
                    .fetch_add(allocsz as i64 - oldallocsz as i64, Ordering::Relaxed);
                collector
                    .live_bytes
                    .fetch_add(allocsz as i64 - oldallocsz as i64, Ordering::Relaxed);
            } else if allocsz < oldallocsz {
                self.gc_num
                    .freed
                    .fetch_add((oldallocsz - allocsz) as i64, Ordering::Relaxed);
            } else {
                self.count_alloc(allocsz - oldallocsz);
            }
            self.gc_num.realloc.fetch_add(1, Ordering::Relaxed);
            let b = aligned::realloc_cache_align(d, allocsz, oldallocsz);
            if b.is_null() {
                return Err(GcError::OutOfMemory);
            }
            Ok(b)
        }
    }

    /// Grow a string. Small or already-marked strings are copied into a
    /// fresh allocation; a big unmarked string is grown in place, which
    /// frees the old block. Callers must hold no aliases to the old
    /// pointer.
    pub fn realloc_string(&mut self, s: *mut Value, sz: usize) -> Result<*mut Value, GcError> {
        unsafe {
            let len = (*s.cast::<GcString>()).len;
            if sz <= len {
                return Ok(s);
            }
            let v = as_tagged(s);
            let strsz = len + size_of::<usize>() + 1;
            if strsz <= GC_MAX_SZCLASS || gc_marked((*v).bits()) {
                // pool allocated; can't be grown in place so copy
                let snew = self.alloc_string(sz)?;
                std::ptr::copy_nonoverlapping(
                    s.cast::<u8>().add(size_of::<usize>()),
                    snew.cast::<u8>().add(size_of::<usize>()),
                    len,
                );
                return Ok(snew);
            }
            let newsz = sz + size_of::<usize>() + 1;
            let offs = size_of::<BigVal>() - WORD;
            let oldallocsz = checked_align_up(strsz + WORD + offs, CACHE_BYTE_ALIGNMENT).unwrap();
            let allocsz = checked_align_up(newsz + WORD + offs, CACHE_BYTE_ALIGNMENT)
                .ok_or(GcError::SizeOverflow)?;
            let hdr = BigVal::from_tagged(v);
            self.maybe_collect(); // don't want this to happen during the realloc
            BigVal::unlink(hdr);
            // grow in place. This frees the old block: any remaining alias
            // to the old string is left dangling, it is on the caller to
            // make sure none exist.
            let newbig = self
                .managed_realloc_(hdr.cast(), allocsz, oldallocsz, s, false)?
                .cast::<BigVal>();
            (*newbig).set_size_age(allocsz, PROMOTE_AGE);
            let tag = (*newbig).tagged();
            (*tag).set_bits(GC_OLD);
            BigVal::link(newbig, &mut self.heap.big_objects);
            let snew = value_of(tag);
            (*snew.cast::<GcString>()).len = sz;
            Ok(snew)
        }
    }

    /// Record an array whose buffer came from `managed_malloc` so the sweep
    /// can free the buffer when the array dies.
    pub fn track_malloced_array(&mut self, a: *mut Value) {
        debug_assert!(unsafe { (*a.cast::<Array>()).how } == crate::types::ARRAY_MALLOC);
        let ma = if self.heap.mafreelist.is_null() {
            Box::into_raw(Box::new(MallocArray {
                a,
                next: null_mut(),
            }))
        } else {
            let ma = self.heap.mafreelist;
            unsafe {
                self.heap.mafreelist = (*ma).next;
                (*ma).a = a;
            }
            ma
        };
        unsafe {
            (*ma).next = self.heap.mallocarrays;
        }
        self.heap.mallocarrays = ma;
    }

    /// Opt `obj` into the foreign sweep pass; its layout's `sweepfunc` runs
    /// every cycle until the object dies.
    pub fn schedule_foreign_sweepfunc(&mut self, obj: *mut Value) {
        self.sweep_objs.push(obj);
    }
}

/// Permanent arena slab size.
pub const GC_PERM_POOL_SIZE: usize = 2 * 1024 * 1024;
/// Requests above this bypass the pool.
pub const GC_PERM_POOL_LIMIT: usize = 20 * 1024;

fn perm_alloc_large(sz: usize, zero: bool, align: usize, offset: usize) -> Result<*mut u8, GcError> {
    // `align` must be a power of two
    debug_assert!(offset == 0 || offset < align);
    let mut sz = sz;
    if align > 1 {
        sz = sz.checked_add(align - 1).ok_or(GcError::SizeOverflow)?;
    }
    unsafe {
        let layout = std::alloc::Layout::from_size_align(sz.max(1), 16).unwrap();
        let base = if zero {
            std::alloc::alloc_zeroed(layout)
        } else {
            std::alloc::alloc(layout)
        };
        if base.is_null() {
            return Err(GcError::OutOfMemory);
        }
        // intentionally leaked: the permanent arena never frees
        let diff = offset.wrapping_sub(base as usize) % align.max(1);
        Ok(base.add(diff))
    }
}

impl Collector {
    fn try_perm_alloc_pool(&self, sz: usize, align: usize, offset: usize) -> *mut u8 {
        let pool = crate::utils::align_up(self.gc_perm_pool.get() + offset, align) - offset;
        let end = pool + sz;
        if end > self.gc_perm_end.get() {
            return null_mut();
        }
        self.gc_perm_pool.set(end);
        pool as *mut u8
    }

    /// Monotonic allocation of immortal data. **Not** a safepoint; the
    /// caller must hold `gc_perm_lock`.
    pub fn perm_alloc_nolock(
        &self,
        sz: usize,
        zero: bool,
        align: usize,
        offset: usize,
    ) -> Result<*mut u8, GcError> {
        debug_assert!(align < GC_PERM_POOL_LIMIT);
        if sz > GC_PERM_POOL_LIMIT {
            return perm_alloc_large(sz, zero, align, offset);
        }
        let ptr = self.try_perm_alloc_pool(sz, align, offset);
        if !ptr.is_null() {
            return Ok(ptr);
        }
        let pool = crate::pages::os_map_raw(GC_PERM_POOL_SIZE);
        if pool.is_null() {
            return Err(GcError::OutOfMemory);
        }
        self.gc_perm_pool.set(pool as usize);
        self.gc_perm_end.set(pool as usize + GC_PERM_POOL_SIZE);
        let ptr = self.try_perm_alloc_pool(sz, align, offset);
        debug_assert!(!ptr.is_null());
        Ok(ptr)
    }

    /// Monotonic allocation of immortal data. **Not** a safepoint.
    pub fn perm_alloc(
        &self,
        sz: usize,
        zero: bool,
        align: usize,
        offset: usize,
    ) -> Result<*mut u8, GcError> {
        debug_assert!(align < GC_PERM_POOL_LIMIT);
        if sz > GC_PERM_POOL_LIMIT {
            return perm_alloc_large(sz, zero, align, offset);
        }
        self.gc_perm_lock.lock();
        let p = self.perm_alloc_nolock(sz, zero, align, offset);
        unsafe {
            self.gc_perm_lock.unlock();
        }
        p
    }

    /// Register the immortal image range: objects inside it are tag-marked
    /// but never have pool or big metadata.
    pub fn set_perm_region(&mut self, start: *mut u8, end: *mut u8) {
        self.perm_region = (start as usize, end as usize);
    }

    #[inline]
    pub(crate) fn in_perm_region(&self, p: usize) -> bool {
        p >= self.perm_region.0 && p < self.perm_region.1
    }
}
