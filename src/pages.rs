//! OS-backed 16 KiB page supplier.
//!
//! Pages are mapped in large blocks to keep the pools close together and
//! amortize the syscall. Idle pages sit in one of three global pools:
//! `clean` (fresh, never handed back to the kernel), `to_madvise` (freed by
//! the last sweep, madvise still pending) and `madvised`. Allocation
//! prefers them in that order before mapping a new block.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use parking_lot::Mutex;

use crate::error::GcError;
use crate::page::{gc_page_data, MemoryMap, PageMeta, GC_PAGE_SZ};

/// Pages per block: 64 MiB on 64-bit, 16 MiB on 32-bit.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_BLOCK_PG_ALLOC: usize = 4096;
#[cfg(target_pointer_width = "32")]
pub const DEFAULT_BLOCK_PG_ALLOC: usize = 1024;

pub struct PageAlloc {
    pub memory_map: *mut MemoryMap,
    pool_clean: Mutex<Vec<*mut PageMeta>>,
    pool_to_madvise: Mutex<Vec<*mut PageMeta>>,
    pool_madvised: Mutex<Vec<*mut PageMeta>>,
    block_pg_cnt: usize,
    os_page_size: usize,
    /// MADV_FREE worked at least once; cleared forever after the first
    /// EINVAL so we fall back to MADV_DONTNEED.
    madv_free_works: AtomicBool,
    pub current_pg_count: AtomicIsize,
}

unsafe impl Send for PageAlloc {}
unsafe impl Sync for PageAlloc {}

impl PageAlloc {
    pub fn new() -> Self {
        let os_page_size = os_page_size();
        let mut block_pg_cnt = DEFAULT_BLOCK_PG_ALLOC;
        if GC_PAGE_SZ * block_pg_cnt < os_page_size {
            block_pg_cnt = os_page_size / GC_PAGE_SZ; // exact division
        }
        Self {
            memory_map: MemoryMap::new(),
            pool_clean: Mutex::new(Vec::new()),
            pool_to_madvise: Mutex::new(Vec::new()),
            pool_madvised: Mutex::new(Vec::new()),
            block_pg_cnt,
            os_page_size,
            madv_free_works: AtomicBool::new(true),
            current_pg_count: AtomicIsize::new(0),
        }
    }

    #[inline]
    pub fn memory_map(&self) -> &MemoryMap {
        unsafe { &*self.memory_map }
    }

    /// Map a block of `block_pg_cnt` pages, aligned to `GC_PAGE_SZ`.
    fn try_alloc_block(&self) -> *mut u8 {
        let mut pages_sz = GC_PAGE_SZ * self.block_pg_cnt;
        if GC_PAGE_SZ > self.os_page_size {
            pages_sz += GC_PAGE_SZ;
        }
        let mem = os_map(pages_sz);
        if mem.is_null() {
            return null_mut();
        }
        if GC_PAGE_SZ > self.os_page_size {
            // round up to the nearest page boundary if the kernel did not
            // already align the mapping
            return gc_page_data(mem as usize + GC_PAGE_SZ - 1);
        }
        mem
    }

    /// Get a page, either from one of the idle pools or from the kernel.
    pub fn alloc_page(&self) -> Result<*mut PageMeta, GcError> {
        if let Some(meta) = self.pool_clean.lock().pop() {
            unsafe {
                self.memory_map().set_alloc((*meta).data as usize, true);
            }
            self.current_pg_count.fetch_add(1, Ordering::Relaxed);
            return Ok(meta);
        }
        if let Some(meta) = self.pool_to_madvise.lock().pop() {
            unsafe {
                self.memory_map().set_alloc((*meta).data as usize, true);
            }
            self.current_pg_count.fetch_add(1, Ordering::Relaxed);
            return Ok(meta);
        }
        if let Some(meta) = self.pool_madvised.lock().pop() {
            unsafe {
                os_commit((*meta).data, GC_PAGE_SZ);
                self.memory_map().set_alloc((*meta).data as usize, true);
            }
            self.current_pg_count.fetch_add(1, Ordering::Relaxed);
            return Ok(meta);
        }

        // all pools dry: map a new block of pages
        let data = self.try_alloc_block();
        if data.is_null() {
            return Err(GcError::OutOfMemory);
        }
        let metas: Box<[PageMeta]> = (0..self.block_pg_cnt).map(|_| PageMeta::new()).collect();
        let metas = Box::leak(metas);
        let mut clean = self.pool_clean.lock();
        for (i, pg) in metas.iter_mut().enumerate() {
            pg.data = unsafe { data.add(GC_PAGE_SZ * i) };
            self.memory_map().set_page_metadata(pg.data as usize, pg);
            if i != 0 {
                clean.push(pg);
            }
        }
        drop(clean);
        let first = &mut metas[0] as *mut PageMeta;
        unsafe {
            os_commit((*first).data, GC_PAGE_SZ);
            self.memory_map().set_alloc((*first).data as usize, true);
        }
        self.current_pg_count.fetch_add(1, Ordering::Relaxed);
        Ok(first)
    }

    /// Return a page to the allocator. The kernel hint is deferred to
    /// `madvise_idle_pages` so the sweep never issues syscalls.
    pub fn free_page(&self, pg: *mut PageMeta) {
        unsafe {
            self.memory_map().set_alloc((*pg).data as usize, false);
        }
        self.current_pg_count.fetch_sub(1, Ordering::Relaxed);
        self.pool_to_madvise.lock().push(pg);
    }

    /// Hint the kernel about every page freed since the last call and move
    /// them to the `madvised` pool. Runs outside the stop-the-world pause.
    pub fn madvise_idle_pages(&self) {
        let pending = std::mem::take(&mut *self.pool_to_madvise.lock());
        if pending.is_empty() {
            return;
        }
        let mut madvised = self.pool_madvised.lock();
        for pg in pending {
            unsafe {
                self.hint_os_free((*pg).data);
            }
            madvised.push(pg);
        }
    }

    /// Tell the OS we don't need this page right now. When the 16 KiB page
    /// is smaller than an OS page, only decommit once every sibling inside
    /// the surrounding OS page is free, so we never release live memory.
    unsafe fn hint_os_free(&self, data: *mut u8) {
        let mut p = data;
        let mut decommit_size = GC_PAGE_SZ;
        if GC_PAGE_SZ < self.os_page_size {
            let n_pages = self.os_page_size / GC_PAGE_SZ; // exact division
            decommit_size = self.os_page_size;
            p = (data as usize & !(self.os_page_size - 1)) as *mut u8;
            let mut other = p;
            for _ in 0..n_pages {
                if self.memory_map().is_alloc(other as usize) {
                    return;
                }
                other = other.add(GC_PAGE_SZ);
            }
        }
        os_decommit(p, decommit_size, &self.madv_free_works);
    }
}

/// Raw anonymous mapping, used by the permanent arena for its slabs.
pub(crate) fn os_map_raw(size: usize) -> *mut u8 {
    os_map(size)
}

#[cfg(unix)]
fn os_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(unix)]
fn os_map(size: usize) -> *mut u8 {
    unsafe {
        let mem = libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_NORESERVE | libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if mem == libc::MAP_FAILED {
            return null_mut();
        }
        mem as *mut u8
    }
}

#[cfg(unix)]
unsafe fn os_commit(_page: *mut u8, _size: usize) {
    // mappings are readable/writable from the start on unix; touching the
    // page after a MADV_DONTNEED faults fresh zero pages back in
}

#[cfg(unix)]
unsafe fn os_decommit(p: *mut u8, size: usize, madv_free_works: &AtomicBool) {
    if madv_free_works.load(Ordering::Relaxed) {
        #[cfg(target_os = "linux")]
        {
            if libc::madvise(p as *mut _, size, libc::MADV_FREE) != -1 {
                return;
            }
            madv_free_works.store(false, Ordering::Relaxed);
        }
        #[cfg(not(target_os = "linux"))]
        madv_free_works.store(false, Ordering::Relaxed);
    }
    libc::madvise(p as *mut _, size, libc::MADV_DONTNEED);
}

#[cfg(windows)]
fn os_page_size() -> usize {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

#[cfg(windows)]
fn os_map(size: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) as *mut u8 }
}

#[cfg(windows)]
unsafe fn os_commit(page: *mut u8, size: usize) {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
    VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
}

#[cfg(windows)]
unsafe fn os_decommit(p: *mut u8, size: usize, _madv_free_works: &AtomicBool) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_DECOMMIT;
    VirtualFree(p.cast(), size, MEM_DECOMMIT);
}
