//! Heap.
//!
//! A heap is the user-visible allocation context: a direct-indexed small-size
//! table for the fast path, plus one page queue per bin for the slow path.
//! Pages are owned by exactly one heap; a heap is owned by exactly one
//! thread. Allocation and free both
//! bottom out in `segment.rs`/`page.rs`; this module is the bin-queue search
//! and page-lifecycle glue behind `alloc`'s fast path, slow-path search, and
//! fresh-page fallback.

use crate::bin;
use crate::error::{self, ErrorKind};
use crate::options::OPTIONS;
use crate::page;
use crate::segment::{self, SegmentsTld};
use crate::stats::{stat_increase, Stats};
use crate::types::*;

use core::ptr::null_mut;
use core::sync::atomic::Ordering;

/// A heap owns a set of pages. `pages_free_direct[w]` is the fast-path cache
/// for word count `w`; `pages[bin]` is the full page
/// queue per bin, plus the `BIN_FULL` queue for pages with no free blocks.
pub struct Heap {
    pub pages_free_direct: [*mut Page; SMALL_WSIZE_MAX + 2],
    pub pages: [PageQueue; BIN_FULL + 1],
    pub thread_delayed_free: ThreadFree,
    pub thread_id: usize,
    pub arena_id: Option<usize>,
    /// Isolation tag copied onto every segment this heap allocates fresh
    /// (`Segment::subproc`). Reclaim only ever crosses segments whose tag
    /// matches the reclaiming heap's, so heaps in different subprocs never
    /// adopt each other's abandoned memory.
    pub subproc: usize,
    pub cookie: usize,
    pub random: usize,
    pub page_count: usize,
    /// `true` for a heap created with `allow_destroy = true` (the default
    /// for `heap_new`/`heap_new_in_arena`): such a heap may be
    /// `heap_destroy`d, and in exchange never opportunistically adopts
    /// abandoned segments when set as a thread's default — a heap that
    /// might get bulk-destroyed has no business silently holding pages a
    /// different, already-exited thread allocated. `heap_new_ex` with
    /// `allow_destroy = false` flips the trade: `heap_destroy` refuses, but
    /// `reclaim_on_alloc`/`try_reclaim_on_free` will adopt through it.
    pub no_reclaim: bool,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Build a fresh heap bound to `thread_id`. Page-queue block sizes are
    /// derived from `bin::bin_block_size` so they stay in lockstep with the
    /// bin table in `bin.rs`.
    pub fn new(
        thread_id: usize,
        cookie: usize,
        random: usize,
        arena_id: Option<usize>,
        subproc: usize,
    ) -> Heap {
        // `[PageQueue::empty(0); N]` would need `PageQueue: Copy`, which it
        // isn't (raw pointers we'd rather not duplicate by accident, same
        // reasoning as `SegmentsTld::new`'s span queues) — build it by hand.
        let mut pages: [PageQueue; BIN_FULL + 1] = core::array::from_fn(|_| PageQueue::empty(0));
        for (bin, queue) in pages.iter_mut().enumerate().take(BIN_HUGE + 1).skip(1) {
            queue.block_size = bin::bin_block_size(bin as u8);
        }
        Heap {
            pages_free_direct: [null_mut(); SMALL_WSIZE_MAX + 2],
            pages,
            thread_delayed_free: ThreadFree::default(),
            thread_id,
            arena_id,
            subproc,
            cookie,
            random,
            page_count: 0,
            no_reclaim: false,
        }
    }
}

#[inline]
fn direct_index(wsize: usize) -> usize {
    wsize.min(SMALL_WSIZE_MAX + 1)
}

unsafe fn page_queue_remove(queue: &mut PageQueue, page: *mut Page) {
    let prev = (*page).prev;
    let next = (*page).next;
    if !prev.is_null() {
        (*prev).next = next;
    } else {
        queue.first = next;
    }
    if !next.is_null() {
        (*next).prev = prev;
    } else {
        queue.last = prev;
    }
    (*page).prev = null_mut();
    (*page).next = null_mut();
}

unsafe fn page_queue_push_front(queue: &mut PageQueue, page: *mut Page) {
    (*page).prev = null_mut();
    (*page).next = queue.first;
    if !queue.first.is_null() {
        (*queue.first).prev = page;
    } else {
        queue.last = page;
    }
    queue.first = page;
}

unsafe fn page_queue_push_back(queue: &mut PageQueue, page: *mut Page) {
    (*page).next = null_mut();
    (*page).prev = queue.last;
    if !queue.last.is_null() {
        (*queue.last).next = page;
    } else {
        queue.first = page;
    }
    queue.last = page;
}

/// Move `page` from its current (full) queue to the bin queue matching its
/// block size, clearing `in_full`.
unsafe fn heap_unfull_page(heap: *mut Heap, page: *mut Page) {
    if !(*page).flags.in_full {
        return;
    }
    page_queue_remove(&mut (*heap).pages[BIN_FULL], page);
    let bin = bin::bin_of_size((*page).block_size) as usize;
    page_queue_push_front(&mut (*heap).pages[bin], page);
    (*page).flags.in_full = false;
}

/// Move `page` into the `BIN_FULL` queue.
unsafe fn heap_full_page(heap: *mut Heap, page: *mut Page) {
    if (*page).flags.in_full {
        return;
    }
    let bin = bin::bin_of_size((*page).block_size) as usize;
    page_queue_remove(&mut (*heap).pages[bin], page);
    page_queue_push_back(&mut (*heap).pages[BIN_FULL], page);
    (*page).flags.in_full = true;
}

/// Wire a freshly carved page into `heap`'s bin queue and direct-access
/// table, and initialize its per-page free-list cookie.
unsafe fn heap_register_page(heap: *mut Heap, page: *mut Page, block_size: usize, wsize_direct: Option<usize>) {
    (*page).heap = heap;
    (*page).block_size = block_size;
    (*page).cookie = if OPTIONS.is_secure() {
        page::new_cookie(page) ^ (*heap).random
    } else {
        0
    };
    let bin = bin::bin_of_size(block_size) as usize;
    page_queue_push_front(&mut (*heap).pages[bin], page);
    (*heap).page_count += 1;
    if let Some(w) = wsize_direct {
        if (*heap).pages_free_direct[direct_index(w)].is_null() {
            (*heap).pages_free_direct[direct_index(w)] = page;
        }
    }
}

/// Allocate one block of `size` bytes from `heap`.
pub unsafe fn heap_alloc(heap: *mut Heap, tld: &mut SegmentsTld, stats: &Stats, size: usize) -> *mut u8 {
    let wsize = bin::wsize_from_size(size);

    // fast path: small sizes go through the direct-index cache.
    if wsize <= SMALL_WSIZE_MAX {
        let idx = direct_index(wsize);
        let page = (*heap).pages_free_direct[idx];
        if !page.is_null() {
            let block = page::page_alloc_block_fast(page);
            if !block.is_null() {
                return block;
            }
            let block = page::page_alloc_block(page, stats);
            if !block.is_null() {
                return block;
            }
            // page exhausted: drop the direct-access cache entry so the next
            // call falls through to the slow path and finds a fresh page.
            (*heap).pages_free_direct[idx] = null_mut();
        }
    }

    heap_alloc_slow(heap, tld, stats, size, wsize)
}

/// Slow path: walk the bin's page queue (bounded by `MAX_SEARCH`, moving
/// exhausted pages to the tail), else ask the segment allocator for a fresh
/// page.
unsafe fn heap_alloc_slow(
    heap: *mut Heap,
    tld: &mut SegmentsTld,
    stats: &Stats,
    size: usize,
    wsize: usize,
) -> *mut u8 {
    crate::tld::on_allocation_slow_path();

    let bin = bin::bin_of_size(size) as usize;
    let block_size = (*heap).pages[bin].block_size;

    let mut probed = 0;
    let mut cur = (*heap).pages[bin].first;
    while !cur.is_null() && probed < MAX_SEARCH {
        let block = page::page_alloc_block(cur, stats);
        if !block.is_null() {
            if wsize <= SMALL_WSIZE_MAX {
                (*heap).pages_free_direct[direct_index(wsize)] = cur;
            }
            return block;
        }
        if page::page_all_free(cur) {
            // emptied entirely between collect and alloc attempt: leave it
            // for `heap_collect` to retire rather than spin on it here.
            cur = (*cur).next;
            continue;
        }
        // page had no free blocks to give: move to the back so the next
        // search visits fresher candidates first, then mark full.
        let next = (*cur).next;
        heap_full_page(heap, cur);
        cur = next;
        probed += 1;
    }

    let page_kind = if block_size <= SMALL_OBJ_SIZE_MAX {
        PageKind::Small
    } else if block_size <= MEDIUM_OBJ_SIZE_MAX {
        PageKind::Medium
    } else if block_size <= LARGE_OBJ_SIZE_MAX {
        PageKind::Large
    } else {
        PageKind::Huge
    };

    let required = block_size.max(size);
    let page = segment::segment_page_alloc(
        page_kind,
        required,
        (*heap).thread_id,
        (*heap).subproc,
        tld,
        stats,
    );
    if page.is_null() {
        error::report(ErrorKind::Oom, size);
        return null_mut();
    }

    let reserved_blocks = if page_kind == PageKind::Huge {
        1
    } else {
        (segment::page_data_size(page) / block_size) as u16
    };
    (*page).reserved = reserved_blocks;
    (*page).capacity = 0;

    let wsize_direct = if wsize <= SMALL_WSIZE_MAX { Some(wsize) } else { None };
    heap_register_page(heap, page, block_size, wsize_direct);
    page::page_extend_free(page, stats);
    stat_increase(&stats.malloc, 1);
    page::page_alloc_block_fast(page)
}

/// Free a block known to belong to the calling thread (`heap_alloc`'s
/// owner). Pushes onto `local_free` and, if the page has now emptied out
/// its direct-access cache is left untouched (`alloc` re-derives it).
pub unsafe fn heap_free_block_local(page: *mut Page, block: *mut Block) {
    let was_full = (*page).flags.in_full;
    page::page_free_block_local(page, block);
    if was_full {
        heap_unfull_page((*page).heap, page);
    }
}

/// Drain every page's `local_free`/`thread_free` back into `free`, retiring
/// pages that end up with `used == 0`. `force` additionally releases cached
/// segments back to the OS.
pub unsafe fn heap_collect(heap: *mut Heap, tld: &mut SegmentsTld, stats: &Stats, force: bool) {
    for bin in 1..=BIN_FULL {
        let mut cur = (*heap).pages[bin].first;
        while !cur.is_null() {
            let next = (*cur).next;
            page::page_thread_free_collect(cur);
            page::page_local_free_collect(cur);
            if page::page_all_free(cur) && bin != BIN_FULL {
                heap_retire_page(heap, cur, tld, stats);
            }
            cur = next;
        }
    }
    if force {
        segment::segments_tld_release_cache(tld, stats);
    }
}

unsafe fn heap_retire_page(heap: *mut Heap, page: *mut Page, tld: &mut SegmentsTld, stats: &Stats) {
    let bin = bin::bin_of_size((*page).block_size) as usize;
    page_queue_remove(&mut (*heap).pages[bin], page);
    (*heap).page_count = (*heap).page_count.saturating_sub(1);
    for entry in (*heap).pages_free_direct.iter_mut() {
        if *entry == page {
            *entry = null_mut();
        }
    }
    page::page_free(page, tld, stats);
}

/// Unlink every page this heap owns and hand its memory straight back to
/// segments, whether or not blocks on it are still "in use" by the caller's
/// bookkeeping. Undefined if any block remains live to the user — callers
/// accept that any outstanding pointers are dangling after this returns.
pub unsafe fn heap_destroy(heap: *mut Heap, tld: &mut SegmentsTld, stats: &Stats) {
    for bin in 1..=BIN_FULL {
        let mut cur = (*heap).pages[bin].first;
        while !cur.is_null() {
            let next = (*cur).next;
            (*cur).next = null_mut();
            (*cur).prev = null_mut();
            page::page_free(cur, tld, stats);
            cur = next;
        }
        (*heap).pages[bin].first = null_mut();
        (*heap).pages[bin].last = null_mut();
    }
    (*heap).pages_free_direct = [null_mut(); SMALL_WSIZE_MAX + 2];
    (*heap).page_count = 0;
}

/// Migrate every non-empty page this heap owns into `backing`, releasing
/// empty ones outright. Safe to call with live blocks still outstanding
///.
pub unsafe fn heap_delete(heap: *mut Heap, backing: *mut Heap, tld: &mut SegmentsTld, stats: &Stats) {
    if heap == backing {
        return;
    }
    for bin in 1..=BIN_FULL {
        let mut cur = (*heap).pages[bin].first;
        while !cur.is_null() {
            let next = (*cur).next;
            (*cur).next = null_mut();
            (*cur).prev = null_mut();
            page::page_thread_free_collect(cur);
            page::page_local_free_collect(cur);
            if page::page_all_free(cur) {
                page::page_free(cur, tld, stats);
            } else {
                let dest_bin = bin::bin_of_size((*cur).block_size) as usize;
                (*cur).heap = backing;
                (*cur).flags.in_full = false;
                page_queue_push_front(&mut (*backing).pages[dest_bin], cur);
                (*backing).page_count += 1;
            }
            cur = next;
        }
        (*heap).pages[bin].first = null_mut();
        (*heap).pages[bin].last = null_mut();
    }
    (*heap).pages_free_direct = [null_mut(); SMALL_WSIZE_MAX + 2];
    (*heap).page_count = 0;
}

/// `true` if `block` is owned by one of `heap`'s pages.
pub unsafe fn heap_contains_block(heap: *mut Heap, block: *const u8) -> bool {
    let page = segment::page_of_ptr(segment::segment_of_ptr(block), block);
    !page.is_null() && (*page).heap == heap
}

/// Walk every live block in `heap`'s pages, calling `visitor(block, size)`.
/// Used by the `heap_visit_blocks` API; stops early
/// if `visitor` returns `false`.
pub unsafe fn heap_visit_blocks(
    heap: *mut Heap,
    visit_all: bool,
    tld: &mut SegmentsTld,
    stats: &Stats,
    mut visitor: impl FnMut(*mut u8, usize) -> bool,
) {
    // `is_allocated_block` below only checks `free`; collect first so blocks
    // sitting on `local_free`/`thread_free` aren't misreported as live.
    heap_collect(heap, tld, stats, false);
    for bin in 1..=BIN_HUGE {
        let mut page = (*heap).pages[bin].first;
        while !page.is_null() {
            let bsize = (*page).block_size;
            let start = segment::page_data_start(page);
            let reserved = (*page).reserved as usize;
            'blocks: for i in 0..reserved {
                let candidate = start.add(i * bsize);
                if !visit_all && !is_allocated_block(page, candidate) {
                    continue 'blocks;
                }
                if !visitor(candidate, bsize) {
                    return;
                }
            }
            page = (*page).next;
        }
    }
}

/// Re-register an already-populated page, recovered from an abandoned
/// segment's non-empty pages, into `heap`'s bin
/// queue. Unlike `heap_register_page` the page keeps its existing
/// `free`/`local_free`/cookie — only ownership and delayed-free state
/// change.
pub unsafe fn reclaim_page_into(heap: *mut Heap, page: *mut Page) {
    (*page).heap = heap;
    (*page).flags.in_full = false;
    (*page).thread_free.0.store(
        ThreadFree::pack(null_mut(), Delayed::NoDelayedFree),
        Ordering::Relaxed,
    );
    let bin = bin::bin_of_size((*page).block_size) as usize;
    page_queue_push_front(&mut (*heap).pages[bin], page);
    (*heap).page_count += 1;
    let wsize = bin::wsize_from_size((*page).block_size);
    if wsize <= SMALL_WSIZE_MAX && (*heap).pages_free_direct[direct_index(wsize)].is_null() {
        (*heap).pages_free_direct[direct_index(wsize)] = page;
    }
}

unsafe fn is_allocated_block(page: *mut Page, candidate: *mut u8) -> bool {
    let mut cur = (*page).free;
    while !cur.is_null() {
        if cur as *mut u8 == candidate {
            return false;
        }
        cur = page::block_next_for_visit(&*page, cur);
    }
    true
}
