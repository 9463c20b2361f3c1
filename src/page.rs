//! Page metadata and the multi-level page table.
//!
//! The whole virtual address space is covered by a three level radix tree
//! keyed on the upper address bits: the leaf level maps 16 KiB pages to
//! their out-of-band metadata, the two upper levels exist sparsely. Each
//! level carries a 32-bit-word alloc bitmap so the sweep can skip empty
//! regions with a single trailing-zeros scan, plus `lb`/`ub` bounds on the
//! occupied words.

use std::alloc::{alloc_zeroed, Layout};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::value::HEAP_ALIGNMENT;
use crate::value::WORD;

pub const GC_PAGE_LG2: usize = 14;
pub const GC_PAGE_SZ: usize = 1 << GC_PAGE_LG2; // 16k
/// Offset of the first cell in a page: padding after the first word (which
/// threads the empty-page list) so cell payloads are heap-aligned.
pub const GC_PAGE_OFFSET: usize = HEAP_ALIGNMENT - (WORD % HEAP_ALIGNMENT);

/// Sentinel for `fl_begin_offset`/`fl_end_offset` of a page without a
/// freelist.
pub const NO_FREELIST: u16 = u16::MAX;

#[cfg(target_pointer_width = "64")]
mod dims {
    pub const REGION0_PG_COUNT: usize = 1 << 16;
    pub const REGION1_PG_COUNT: usize = 1 << 16;
    pub const REGION2_PG_COUNT: usize = 1 << 18;

    #[inline(always)]
    pub fn region0_index(p: usize) -> usize {
        (p >> 14) & 0xFFFF
    }
    #[inline(always)]
    pub fn region1_index(p: usize) -> usize {
        (p >> 30) & 0xFFFF
    }
    #[inline(always)]
    pub fn region2_index(p: usize) -> usize {
        (p >> 46) & 0x3FFFF
    }
}

#[cfg(target_pointer_width = "32")]
mod dims {
    pub const REGION0_PG_COUNT: usize = 1 << 8;
    pub const REGION1_PG_COUNT: usize = 1 << 10;
    pub const REGION2_PG_COUNT: usize = 1;

    #[inline(always)]
    pub fn region0_index(p: usize) -> usize {
        (p >> 14) & 0xFF
    }
    #[inline(always)]
    pub fn region1_index(p: usize) -> usize {
        (p >> 22) & 0x3FF
    }
    #[inline(always)]
    pub fn region2_index(_p: usize) -> usize {
        0
    }
}

pub use dims::*;

/// Round an address inside a page down to the page start.
#[inline(always)]
pub fn gc_page_data(x: usize) -> *mut u8 {
    ((x >> GC_PAGE_LG2) << GC_PAGE_LG2) as *mut u8
}

/// Out-of-band metadata for one 16 KiB pool page.
///
/// `has_marked`, `has_young`, `nold` and the age bytes are raced by
/// parallel markers and therefore relaxed atomics; everything else is
/// only touched by the owning pool or the (single threaded) sweep.
pub struct PageMeta {
    /// Index of the owning pool within its thread heap.
    pub pool_n: u8,
    /// Whether any cell in the page was reached this cycle. After a sweep
    /// this means "has old-marked cells"; a page without it is fully
    /// reclaimable.
    pub has_marked: AtomicU8,
    /// Whether any live young cell was seen before sweeping. A quick sweep
    /// skips pages without it when `prev_nold == nold` still holds.
    pub has_young: AtomicU8,
    /// Number of old cells.
    pub nold: AtomicU16,
    /// `nold` as recorded by the previous full sweep.
    pub prev_nold: u16,
    /// Free cells. Invalid while the owning pool is allocating from this
    /// page.
    pub nfree: u16,
    /// Cell size, tag included.
    pub osize: u16,
    pub fl_begin_offset: u16,
    pub fl_end_offset: u16,
    /// Owning mutator.
    pub thread_n: u16,
    pub data: *mut u8,
    /// One bit per cell: survived the last sweep.
    pub ages: *mut u8,
}

impl PageMeta {
    pub const fn new() -> Self {
        Self {
            pool_n: 0,
            has_marked: AtomicU8::new(0),
            has_young: AtomicU8::new(0),
            nold: AtomicU16::new(0),
            prev_nold: 0,
            nfree: 0,
            osize: 0,
            fl_begin_offset: NO_FREELIST,
            fl_end_offset: NO_FREELIST,
            thread_n: 0,
            data: std::ptr::null_mut(),
            ages: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn ages_len(osize: usize) -> usize {
        GC_PAGE_SZ / 8 / osize + 1
    }
}

pub struct PageTable0 {
    pub meta: [AtomicPtr<PageMeta>; REGION0_PG_COUNT],
    pub allocmap: [AtomicU32; REGION0_PG_COUNT / 32],
    pub lb: AtomicI32,
    pub ub: AtomicI32,
}

pub struct PageTable1 {
    pub meta0: [AtomicPtr<PageTable0>; REGION1_PG_COUNT],
    pub allocmap0: [AtomicU32; REGION1_PG_COUNT / 32],
    pub lb: AtomicI32,
    pub ub: AtomicI32,
}

/// Top level of the page table; covers the whole address space.
pub struct MemoryMap {
    pub meta1: [AtomicPtr<PageTable1>; REGION2_PG_COUNT],
    pub allocmap1: [AtomicU32; (REGION2_PG_COUNT + 31) / 32],
    pub lb: AtomicI32,
    pub ub: AtomicI32,
}

/// Zeroed heap allocation for the (large) table levels.
unsafe fn alloc_zeroed_raw<T>() -> *mut T {
    let ptr = alloc_zeroed(Layout::new::<T>());
    assert!(!ptr.is_null(), "page table allocation failed");
    ptr.cast()
}

impl MemoryMap {
    pub fn new() -> *mut MemoryMap {
        unsafe { alloc_zeroed_raw() }
    }

    /// Leaf metadata lookup for an arbitrary address; null when the address
    /// is not a pool page.
    #[inline]
    pub fn page_metadata(&self, data: usize) -> *mut PageMeta {
        let r1 = self.meta1[region2_index(data)].load(Ordering::Relaxed);
        if r1.is_null() {
            return std::ptr::null_mut();
        }
        unsafe {
            let r0 = (*r1).meta0[region1_index(data)].load(Ordering::Relaxed);
            if r0.is_null() {
                return std::ptr::null_mut();
            }
            (*r0).meta[region0_index(data)].load(Ordering::Relaxed)
        }
    }

    /// Like `page_metadata` but only when the page is currently allocated
    /// to a pool.
    #[inline]
    pub fn page_metadata_allocd(&self, data: usize) -> *mut PageMeta {
        let r1 = self.meta1[region2_index(data)].load(Ordering::Relaxed);
        if r1.is_null() {
            return std::ptr::null_mut();
        }
        unsafe {
            let r0 = (*r1).meta0[region1_index(data)].load(Ordering::Relaxed);
            if r0.is_null() {
                return std::ptr::null_mut();
            }
            let i = region0_index(data);
            if (*r0).allocmap[i / 32].load(Ordering::Relaxed) & (1 << (i % 32)) == 0 {
                return std::ptr::null_mut();
            }
            (*r0).meta[i].load(Ordering::Relaxed)
        }
    }

    /// Create the intermediate levels for `data` and install `meta` in the
    /// leaf slot. Caller holds the page-allocator lock.
    pub fn set_page_metadata(&self, data: usize, meta: *mut PageMeta) {
        let i2 = region2_index(data);
        let mut r1 = self.meta1[i2].load(Ordering::Relaxed);
        if r1.is_null() {
            r1 = unsafe { alloc_zeroed_raw::<PageTable1>() };
            self.meta1[i2].store(r1, Ordering::Relaxed);
        }
        unsafe {
            let i1 = region1_index(data);
            let mut r0 = (*r1).meta0[i1].load(Ordering::Relaxed);
            if r0.is_null() {
                r0 = alloc_zeroed_raw::<PageTable0>();
                (*r1).meta0[i1].store(r0, Ordering::Relaxed);
            }
            (*r0).meta[region0_index(data)].store(meta, Ordering::Relaxed);
        }
    }

    /// Flip the alloc bit for `data`'s page. Setting propagates to the
    /// upper levels and widens their bounds; clearing only touches the
    /// leaf, and the sweep prunes upper bits when it proves a subtree
    /// empty.
    pub fn set_alloc(&self, data: usize, on: bool) {
        let i2 = region2_index(data);
        let r1 = self.meta1[i2].load(Ordering::Relaxed);
        debug_assert!(!r1.is_null());
        unsafe {
            let i1 = region1_index(data);
            let r0 = (*r1).meta0[i1].load(Ordering::Relaxed);
            debug_assert!(!r0.is_null());
            let i0 = region0_index(data);
            if on {
                (*r0).allocmap[i0 / 32].fetch_or(1 << (i0 % 32), Ordering::Relaxed);
                (*r1).allocmap0[i1 / 32].fetch_or(1 << (i1 % 32), Ordering::Relaxed);
                self.allocmap1[i2 / 32].fetch_or(1 << (i2 % 32), Ordering::Relaxed);
                widen_bounds(&(*r0).lb, &(*r0).ub, (i0 / 32) as i32);
                widen_bounds(&(*r1).lb, &(*r1).ub, (i1 / 32) as i32);
                widen_bounds(&self.lb, &self.ub, (i2 / 32) as i32);
            } else {
                (*r0).allocmap[i0 / 32].fetch_and(!(1 << (i0 % 32)), Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn is_alloc(&self, data: usize) -> bool {
        let r1 = self.meta1[region2_index(data)].load(Ordering::Relaxed);
        if r1.is_null() {
            return false;
        }
        unsafe {
            let r0 = (*r1).meta0[region1_index(data)].load(Ordering::Relaxed);
            if r0.is_null() {
                return false;
            }
            let i0 = region0_index(data);
            (*r0).allocmap[i0 / 32].load(Ordering::Relaxed) & (1 << (i0 % 32)) != 0
        }
    }
}

fn widen_bounds(lb: &AtomicI32, ub: &AtomicI32, i: i32) {
    if lb.load(Ordering::Relaxed) > i {
        lb.store(i, Ordering::Relaxed);
    }
    if ub.load(Ordering::Relaxed) < i {
        ub.store(i, Ordering::Relaxed);
    }
}
