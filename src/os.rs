//! OS memory interface. The minimum portability surface the
//! rest of the core depends on: reserve/commit/decommit/reset/protect plus
//! huge-page and NUMA hints. Platform dispatch is a plain `cfg_if!` over two
//! concrete modules: no trait object, no virtual call on the hot path.
//!
//! All addresses and sizes passed across this boundary are page-aligned
//! multiples.

use crate::stats::{stat_increase, Stats};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
static ALLOC_GRANULARITY: AtomicUsize = AtomicUsize::new(4096);
static LARGE_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub fn os_page_size() -> usize {
    PAGE_SIZE.load(Ordering::Relaxed)
}

pub fn os_alloc_granularity() -> usize {
    ALLOC_GRANULARITY.load(Ordering::Relaxed)
}

fn use_large_os_page(size: usize, align: usize) -> bool {
    let large = LARGE_PAGE_SIZE.load(Ordering::Relaxed);
    large != 0 && size % large == 0 && align % large == 0
}

#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    let mask = align - 1;
    (size + mask) & !mask
}

#[inline]
pub fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    size & !(align - 1)
}

#[inline]
pub fn align_up_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    align_up(ptr as usize, align) as *mut u8
}

#[inline]
pub fn align_down_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    align_down(ptr as usize, align) as *mut u8
}

/// Round a requested size up to a size the OS allocates efficiently.
fn os_good_alloc_size(size: usize) -> usize {
    if size >= usize::MAX - os_alloc_granularity() {
        return size;
    }
    align_up(size, os_alloc_granularity())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix {
            use super::*;

            pub fn init(allow_large_pages: bool) {
                let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if page_size > 0 {
                    PAGE_SIZE.store(page_size as usize, Ordering::Relaxed);
                    ALLOC_GRANULARITY.store(page_size as usize, Ordering::Relaxed);
                }
                if allow_large_pages {
                    LARGE_PAGE_SIZE.store(2 * 1024 * 1024, Ordering::Relaxed);
                }
            }

            pub unsafe fn mem_alloc(size: usize, try_align: usize, commit: bool) -> *mut u8 {
                let prot = if commit {
                    libc::PROT_READ | libc::PROT_WRITE
                } else {
                    libc::PROT_NONE
                };
                let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
                if use_large_os_page(size, try_align) {
                    #[cfg(target_os = "linux")]
                    {
                        flags |= libc::MAP_HUGETLB;
                    }
                }
                let p = libc::mmap(null_mut(), size, prot, flags, -1, 0);
                if p == libc::MAP_FAILED {
                    if flags != (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) {
                        // huge pages unavailable: fall back to a regular mapping.
                        let p2 = libc::mmap(
                            null_mut(),
                            size,
                            prot,
                            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                            -1,
                            0,
                        );
                        if p2 == libc::MAP_FAILED {
                            return null_mut();
                        }
                        return p2 as *mut u8;
                    }
                    return null_mut();
                }
                p as *mut u8
            }

            pub unsafe fn mem_free(addr: *mut u8, size: usize) -> bool {
                libc::munmap(addr as *mut _, size) == 0
            }

            pub unsafe fn commit(addr: *mut u8, size: usize) -> bool {
                libc::mprotect(addr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0
            }

            pub unsafe fn decommit(addr: *mut u8, size: usize) -> bool {
                libc::mprotect(addr as *mut _, size, libc::PROT_NONE) == 0
            }

            pub unsafe fn reset(addr: *mut u8, size: usize) -> bool {
                libc::madvise(addr as *mut _, size, libc::MADV_DONTNEED) == 0
            }

            pub unsafe fn protect(addr: *mut u8, size: usize, protect: bool) -> bool {
                let prot = if protect {
                    libc::PROT_NONE
                } else {
                    libc::PROT_READ | libc::PROT_WRITE
                };
                libc::mprotect(addr as *mut _, size, prot) == 0
            }

            pub fn numa_node_count() -> usize {
                1
            }

            pub fn current_numa_node() -> usize {
                0
            }
        }
        use unix as plat;
    } else if #[cfg(windows)] {
        mod windows {
            use super::*;
            use winapi::shared::minwindef::DWORD;
            use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
            use winapi::um::winnt::{
                MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_NOACCESS,
                PAGE_READWRITE,
            };

            pub fn init(_allow_large_pages: bool) {
                unsafe {
                    let mut si: SYSTEM_INFO = core::mem::zeroed();
                    GetSystemInfo(&mut si);
                    if si.dwPageSize > 0 {
                        PAGE_SIZE.store(si.dwPageSize as usize, Ordering::Relaxed);
                    }
                    if si.dwAllocationGranularity > 0 {
                        ALLOC_GRANULARITY
                            .store(si.dwAllocationGranularity as usize, Ordering::Relaxed);
                    }
                }
            }

            pub unsafe fn mem_alloc(size: usize, _try_align: usize, commit: bool) -> *mut u8 {
                let mut flags: DWORD = MEM_RESERVE;
                if commit {
                    flags |= MEM_COMMIT;
                }
                VirtualAlloc(null_mut(), size, flags, PAGE_READWRITE) as *mut u8
            }

            pub unsafe fn mem_free(addr: *mut u8, _size: usize) -> bool {
                VirtualFree(addr as *mut _, 0, MEM_RELEASE) != 0
            }

            pub unsafe fn commit(addr: *mut u8, size: usize) -> bool {
                !VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_READWRITE).is_null()
            }

            pub unsafe fn decommit(addr: *mut u8, size: usize) -> bool {
                VirtualFree(addr as *mut _, size, MEM_DECOMMIT) != 0
            }

            pub unsafe fn reset(addr: *mut u8, size: usize) -> bool {
                !VirtualAlloc(addr as *mut _, size, MEM_RESET, PAGE_READWRITE).is_null()
            }

            pub unsafe fn protect(addr: *mut u8, size: usize, protect: bool) -> bool {
                let mut old = 0;
                VirtualProtect(
                    addr as *mut _,
                    size,
                    if protect { PAGE_NOACCESS } else { PAGE_READWRITE },
                    &mut old,
                ) != 0
            }

            pub fn numa_node_count() -> usize {
                1
            }

            pub fn current_numa_node() -> usize {
                0
            }
        }
        use windows as plat;
    }
}

pub fn os_init(allow_large_pages: bool) {
    plat::init(allow_large_pages);
}

/// Primitive (non-aligned) allocation from the OS.
pub unsafe fn os_alloc(size: usize, stats: &Stats) -> *mut u8 {
    if size == 0 {
        return null_mut();
    }
    let size = os_good_alloc_size(size);
    let p = plat::mem_alloc(size, 0, true);
    stat_increase(&stats.mmap_calls, 1);
    if !p.is_null() {
        stat_increase(&stats.reserved, size as i64);
        stat_increase(&stats.committed, size as i64);
    } else {
        warn!("os_alloc: failed to reserve {} bytes, errno {}", size, errno::errno());
    }
    p
}

pub unsafe fn os_free(p: *mut u8, size: usize, stats: &Stats) {
    if p.is_null() || size == 0 {
        return;
    }
    let size = os_good_alloc_size(size);
    if !plat::mem_free(p, size) {
        warn!("os_free: munmap/VirtualFree failed for {:p}, errno {}", p, errno::errno());
    }
    stat_increase(&stats.committed, -(size as i64));
    stat_increase(&stats.reserved, -(size as i64));
}

/// Allocation guaranteed aligned to `align` (a power of two, >= page size).
/// Implemented by over-allocating and trimming the unaligned tails, since
/// neither `libc::mmap` nor `VirtualAlloc` guarantee alignment directly.
pub unsafe fn os_alloc_aligned(mut size: usize, mut align: usize, stats: &Stats) -> *mut u8 {
    if size == 0 {
        return null_mut();
    }
    size = os_good_alloc_size(size);
    align = align_up(align, os_page_size());

    let p = plat::mem_alloc(size, align, true);
    if p.is_null() {
        return null_mut();
    }
    stat_increase(&stats.mmap_calls, 1);
    if p as usize % align == 0 {
        stat_increase(&stats.reserved, size as i64);
        stat_increase(&stats.committed, size as i64);
        return p;
    }

    // not aligned: free and over-allocate so a correctly aligned window
    // exists somewhere inside, then trim.
    plat::mem_free(p, size);
    if size >= usize::MAX - align {
        return null_mut();
    }
    let over_size = size + align;
    let raw = plat::mem_alloc(over_size, align, true);
    if raw.is_null() {
        return null_mut();
    }
    let aligned = align_up_ptr(raw, align);

    #[cfg(unix)]
    {
        let pre = aligned as usize - raw as usize;
        let post = over_size - pre - size;
        if pre > 0 {
            plat::mem_free(raw, pre);
        }
        if post > 0 {
            plat::mem_free((aligned as usize + size) as *mut u8, post);
        }
        stat_increase(&stats.reserved, size as i64);
        stat_increase(&stats.committed, size as i64);
        aligned
    }
    #[cfg(windows)]
    {
        // VirtualFree can only release a whole mapping, never a sub-range, so
        // trimming like the unix path is not possible. Give back the
        // over-allocation and retry once; good enough for the common case
        // where a second random mapping happens to land aligned.
        plat::mem_free(raw, over_size);
        let p2 = plat::mem_alloc(size, align, true);
        if !p2.is_null() {
            stat_increase(&stats.reserved, size as i64);
            stat_increase(&stats.committed, size as i64);
        }
        p2
    }
}

pub unsafe fn os_commit(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let start = align_down_ptr(addr, os_page_size());
    let end = align_up(addr as usize + size, os_page_size());
    let csize = end - start as usize;
    stat_increase(&stats.committed, csize as i64);
    stat_increase(&stats.commit_calls, 1);
    let ok = plat::commit(start, csize);
    if !ok {
        warn!("os_commit: failed for {:p}..+{}, errno {}", start, csize, errno::errno());
    }
    ok
}

pub unsafe fn os_decommit(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let start = align_up_ptr(addr, os_page_size());
    let end = align_down(addr as usize + size, os_page_size());
    if end <= start as usize {
        return true;
    }
    let csize = end - start as usize;
    stat_increase(&stats.committed, -(csize as i64));
    let ok = plat::decommit(start, csize);
    if !ok {
        warn!("os_decommit: failed for {:p}..+{}, errno {}", start, csize, errno::errno());
    }
    ok
}

pub unsafe fn os_reset(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let start = align_up_ptr(addr, os_page_size());
    let end = align_down(addr as usize + size, os_page_size());
    if end <= start as usize {
        return true;
    }
    let csize = end - start as usize;
    stat_increase(&stats.reset, csize as i64);
    let ok = plat::reset(start, csize);
    if !ok {
        warn!("os_reset: failed for {:p}..+{}, errno {}", start, csize, errno::errno());
    }
    ok
}

pub unsafe fn os_protect(addr: *mut u8, size: usize) -> bool {
    let start = align_up_ptr(addr, os_page_size());
    let end = align_down(addr as usize + size, os_page_size());
    if end <= start as usize {
        return false;
    }
    plat::protect(start, end - start as usize, true)
}

pub unsafe fn os_unprotect(addr: *mut u8, size: usize) -> bool {
    let start = align_up_ptr(addr, os_page_size());
    let end = align_down(addr as usize + size, os_page_size());
    if end <= start as usize {
        return false;
    }
    plat::protect(start, end - start as usize, false)
}

pub fn numa_node_count() -> usize {
    plat::numa_node_count()
}

pub fn current_numa_node() -> usize {
    plat::current_numa_node()
}

/// Best-effort huge-segment reservation. On platforms/configurations without
/// huge-page support this degrades to a regular aligned reservation — no
/// silent corruption, just no huge-page benefit. Time-budgeted huge-page
/// reservation is left to the
/// caller, which knows the deadline; this just performs one attempt.
pub unsafe fn reserve_huge(size: usize, _numa_hint: usize, stats: &Stats) -> Option<*mut u8> {
    let p = os_alloc_aligned(size, crate::types::SEGMENT_SIZE, stats);
    if p.is_null() {
        None
    } else {
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_roundtrip() {
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
    }
}
