//! Public allocation and heap API.
//!
//! Thin glue: every function here resolves a heap/page/block and delegates
//! to `heap.rs`/`page.rs`/`remote.rs`/`abandon.rs`/`aligned.rs`, using
//! `tld.rs` to find the calling thread's own context. This is the only
//! module callers outside the crate are meant to reach through directly
//! (besides the `GlobalAlloc` impl in `lib.rs`, which is itself built on
//! top of `alloc`/`free` here).

use crate::abandon;
use crate::aligned;
use crate::bin;
use crate::error::{self, ErrorKind};
use crate::heap::{self, Heap};
use crate::options::OPTIONS;
use crate::remote::{self, DeferredFreeFn};
use crate::segment;
use crate::stats::Stats;
use crate::tld;
use crate::types::Block;

use core::ptr::null_mut;
use core::sync::atomic::Ordering;

/// `alloc(size)`: allocate from the calling thread's default
/// heap.
pub unsafe fn alloc(size: usize) -> *mut u8 {
    heap_alloc(tld::default_heap(), size)
}

/// `alloc_zero(size)`.
pub unsafe fn alloc_zero(size: usize) -> *mut u8 {
    heap_alloc_zero(tld::default_heap(), size)
}

/// `zalloc(count, size)`: `count * size` with overflow checked up front
///.
pub unsafe fn zalloc(count: usize, size: usize) -> *mut u8 {
    match count.checked_mul(size) {
        Some(total) => alloc_zero(total),
        None => {
            error::report(ErrorKind::Overflow, count.max(size));
            null_mut()
        }
    }
}

/// `alloc_aligned(size, align[, offset])`.
pub unsafe fn alloc_aligned(size: usize, align: usize, offset: usize) -> *mut u8 {
    heap_alloc_aligned(tld::default_heap(), size, align, offset)
}

/// `free(ptr)`. Dispatches to the
/// owner-local fast path when the calling thread happens to own `ptr`'s
/// page, the cross-thread path otherwise; `page.heap` carrying the
/// abandoned sentinel additionally means the segment is currently
/// `ABANDONED`, so a reclaim is attempted once the remote free itself has
/// landed.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let seg = segment::segment_of_ptr(ptr);
    let page = segment::page_of_ptr(seg, ptr);
    if page.is_null() {
        error::report(ErrorKind::InvalidPointer, ptr as usize);
        return;
    }
    let block = aligned::resolve_block_start(page, ptr) as *mut Block;
    let owner = (*page).heap;
    let my_id = tld::thread_id();
    let abandoned = owner == crate::types::ABANDONED_HEAP;

    if !abandoned && !owner.is_null() && (*owner).thread_id == my_id {
        heap::heap_free_block_local(page, block);
        return;
    }

    remote::free_remote(page, block);

    if abandoned && OPTIONS.abandoned_reclaim_on_free.load(Ordering::Relaxed) {
        abandon::try_reclaim_on_free(seg, tld::default_heap(), my_id);
    }
}

/// `usable_size(ptr)`: the full block backing `ptr`, which may be larger
/// than the size originally requested.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let seg = segment::segment_of_ptr(ptr);
    let page = segment::page_of_ptr(seg, ptr);
    if page.is_null() {
        return 0;
    }
    let block_start = aligned::resolve_block_start(page, ptr as *mut u8);
    let consumed = ptr as usize - block_start as usize;
    (*page).block_size.saturating_sub(consumed)
}

/// `good_size(size)`: the block size `alloc(size)` would
/// actually hand out.
pub fn good_size(size: usize) -> usize {
    bin::good_size(size.max(1))
}

/// `realloc(ptr, newsize)`. Grows or shrinks in place when the
/// current block's class already covers `newsize`; otherwise allocates
/// fresh, copies the overlap, and frees the original.
pub unsafe fn realloc(ptr: *mut u8, newsize: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(newsize);
    }
    if newsize == 0 {
        free(ptr);
        return null_mut();
    }

    let old_usable = usable_size(ptr);
    if newsize <= old_usable {
        return ptr;
    }

    let new_ptr = alloc(newsize);
    if new_ptr.is_null() {
        return null_mut();
    }
    core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(newsize));
    free(ptr);
    new_ptr
}

/// `realloc_zero(ptr, newsize)`: like `realloc`, zeroing the newly grown
/// tail.
pub unsafe fn realloc_zero(ptr: *mut u8, newsize: usize) -> *mut u8 {
    let old_usable = if ptr.is_null() { 0 } else { usable_size(ptr) };
    let new_ptr = realloc(ptr, newsize);
    if !new_ptr.is_null() && newsize > old_usable {
        core::ptr::write_bytes(new_ptr.add(old_usable), 0, newsize - old_usable);
    }
    new_ptr
}

// ---------------------------------------------------------------------
// Heap API
// ---------------------------------------------------------------------

/// `heap_new()`: a fresh heap owned by the calling thread, destroyable
/// independently of its backing heap.
pub unsafe fn heap_new() -> *mut Heap {
    tld::heap_new_in_arena(None)
}

pub unsafe fn heap_new_in_arena(arena_id: usize) -> *mut Heap {
    tld::heap_new_in_arena(Some(arena_id))
}

/// `heap_new_in_subproc(subproc)`: a fresh heap tagged with an isolation
/// `subproc` id. Segments this heap allocates only ever get reclaimed by
/// another heap tagged with the same `subproc`, letting independent
/// "allocator realms" share a process without adopting each other's
/// abandoned memory.
pub unsafe fn heap_new_in_subproc(subproc: usize) -> *mut Heap {
    tld::heap_new_in_subproc(subproc, None)
}

/// `heap_new_ex(tag, allow_destroy, arena_id)`: as `heap_new`, but lets the
/// caller trade away `heap_destroy` in exchange for this heap being allowed
/// to adopt abandoned segments when set as the thread's default (pass
/// `allow_destroy = false` for a heap meant to outlive the threads that
/// abandon pages into it).
pub unsafe fn heap_new_ex(tag: usize, allow_destroy: bool, arena_id: Option<usize>) -> *mut Heap {
    tld::heap_new_ex(tag, allow_destroy, arena_id)
}

pub fn heap_set_default(heap: *mut Heap) -> *mut Heap {
    tld::set_default_heap(heap)
}

pub fn heap_get_default() -> *mut Heap {
    tld::default_heap()
}

pub fn heap_get_backing() -> *mut Heap {
    tld::backing_heap()
}

/// `heap_destroy(heap)`: release every page outright,
/// undefined if blocks on it are still referenced by the caller. A no-op
/// (same as calling it on the backing heap) for a heap created with
/// `allow_destroy = false`, since such a heap may be holding pages adopted
/// from an exited thread that this caller never allocated.
pub unsafe fn heap_destroy(heap: *mut Heap) {
    if heap.is_null() || heap == tld::backing_heap() || !(*heap).no_reclaim {
        return;
    }
    tld::with_tld(|t| heap::heap_destroy(heap, &mut t.segments, &t.stats));
    tld::release_extra_heap(heap);
}

/// `heap_delete(heap)`: migrate live pages into the backing
/// heap, release empty ones, then free `heap` itself.
pub unsafe fn heap_delete(heap: *mut Heap) {
    if heap.is_null() || heap == tld::backing_heap() {
        return;
    }
    let backing = tld::backing_heap();
    tld::with_tld(|t| heap::heap_delete(heap, backing, &mut t.segments, &t.stats));
    tld::release_extra_heap(heap);
}

pub unsafe fn heap_collect(heap: *mut Heap, force: bool) {
    tld::with_tld(|t| heap::heap_collect(heap, &mut t.segments, &t.stats, force));
}

pub unsafe fn heap_contains_block(heap: *mut Heap, block: *const u8) -> bool {
    heap::heap_contains_block(heap, block)
}

/// `heap_check_owned(heap, ptr)`: like `heap_contains_block` but tolerant of
/// a pointer this allocator never returned at all.
pub unsafe fn heap_check_owned(heap: *mut Heap, ptr: *const u8) -> bool {
    if ptr.is_null() {
        return false;
    }
    let page = segment::page_of_ptr(segment::segment_of_ptr(ptr), ptr);
    !page.is_null() && (*page).heap == heap
}

pub unsafe fn heap_visit_blocks(heap: *mut Heap, visit_all: bool, visitor: impl FnMut(*mut u8, usize) -> bool) {
    tld::with_tld(|t| heap::heap_visit_blocks(heap, visit_all, &mut t.segments, &t.stats, visitor));
}

pub unsafe fn heap_alloc(heap: *mut Heap, size: usize) -> *mut u8 {
    tld::with_tld(|t| heap::heap_alloc(heap, &mut t.segments, &t.stats, size))
}

pub unsafe fn heap_alloc_zero(heap: *mut Heap, size: usize) -> *mut u8 {
    let p = heap_alloc(heap, size);
    if !p.is_null() {
        core::ptr::write_bytes(p, 0, usable_size(p));
    }
    p
}

pub unsafe fn heap_alloc_aligned(heap: *mut Heap, size: usize, align: usize, offset: usize) -> *mut u8 {
    tld::with_tld(|t| aligned::heap_alloc_aligned(heap, &mut t.segments, &t.stats, size, align, offset))
}

/// Register the process-wide deferred-free callback.
pub fn register_deferred_free(callback: Option<DeferredFreeFn>, arg: usize) {
    remote::set_deferred_free(callback, arg);
}

/// Register the process-wide error callback.
pub fn register_error_callback(callback: Option<error::ErrorCallback>) {
    error::set_error_callback(callback);
}

/// Snapshot the calling thread's live `Stats` via `f`, without merging in
/// other threads' totals.
pub fn with_thread_stats<R>(f: impl FnOnce(&Stats) -> R) -> R {
    tld::with_tld(|t| f(&t.stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_size_never_shrinks_request() {
        for size in [1usize, 8, 100, 4096, 70000] {
            assert!(good_size(size) >= size);
        }
    }

    #[test]
    fn alloc_free_roundtrip_small() {
        unsafe {
            let p = alloc(32);
            assert!(!p.is_null());
            assert!(usable_size(p) >= 32);
            core::ptr::write_bytes(p, 0xAB, 32);
            free(p);
        }
    }

    #[test]
    fn zalloc_zeroes_memory() {
        unsafe {
            let p = zalloc(16, 4);
            assert!(!p.is_null());
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
            free(p);
        }
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        unsafe {
            let p = alloc(16);
            core::ptr::write_bytes(p, 0x7, 16);
            let p2 = realloc(p, 256);
            assert!(!p2.is_null());
            for i in 0..16 {
                assert_eq!(*p2.add(i), 0x7);
            }
            free(p2);
        }
    }

    #[test]
    fn heap_new_and_delete() {
        unsafe {
            let h = heap_new();
            assert!(!h.is_null());
            let p = heap_alloc(h, 64);
            assert!(!p.is_null());
            heap_delete(h);
        }
    }

    #[test]
    fn heap_new_ex_disallows_destroy_when_requested() {
        unsafe {
            let h = heap_new_ex(0, false, None);
            assert!(!h.is_null());
            let p = heap_alloc(h, 48);
            assert!(!p.is_null());
            *p = 0x9;
            // `allow_destroy = false`: `heap_destroy` must refuse, same as
            // it does for the backing heap, leaving the block intact.
            heap_destroy(h);
            assert_eq!(*p, 0x9);
            heap_delete(h);
        }
    }

    #[test]
    fn zalloc_overflow_returns_null() {
        unsafe {
            let p = zalloc(usize::MAX, 2);
            assert!(p.is_null());
        }
    }
}
