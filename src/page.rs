//! Page operations. A page owns a singly linked `free` list of untyped blocks; frees
//! from the owning thread splice directly onto `free`/`local_free`, frees
//! from any other thread land on the atomic `thread_free` list instead
//!, to be folded back in by
//! `page_thread_free_collect` the next time the owning thread visits the
//! page.

use crate::error::{self, ErrorKind};
use crate::options::OPTIONS;
use crate::segment;
use crate::stats::{stat_increase, Stats};
use crate::types::*;

use core::ptr::null_mut;
use core::sync::atomic::Ordering;

/// How many new blocks `page_extend_free` carves out of unused capacity in
/// one call. Keeps a single slow-path visit from committing an entire large
/// page's worth of blocks at once.
const MAX_EXTEND: u16 = 256;

#[inline]
unsafe fn block_next(page: &Page, block: *mut Block) -> *mut Block {
    let raw = (*block).next;
    if OPTIONS.is_secure() {
        (raw ^ page.cookie) as *mut Block
    } else {
        raw as *mut Block
    }
}

#[inline]
unsafe fn block_set_next(page: &Page, block: *mut Block, next: *mut Block) {
    (*block).next = if OPTIONS.is_secure() {
        (next as usize) ^ page.cookie
    } else {
        next as usize
    };
}

/// A cheap, non-cryptographic per-page tag used to XOR-encode free-list
/// links in secure mode: it turns a
/// corrupted or attacker-controlled `next` value into a wild pointer that
/// `page_alloc_block`'s bounds check below catches, rather than a usable
/// forged pointer.
pub fn new_cookie(page: *mut Page) -> usize {
    let addr = page as usize;
    addr.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ addr
}

#[inline]
unsafe fn block_in_page_bounds(page: *mut Page, block: *mut Block) -> bool {
    if block.is_null() {
        return true;
    }
    let start = segment::page_data_start(page) as usize;
    let size = segment::page_data_size(page);
    let addr = block as usize;
    addr >= start && addr < start + size
}

/// Pop one block off a page's owner-side free list. Falls back to
/// `local_free`/remote collection/extension via the slow path; this is only
/// the fast path.
#[inline]
pub unsafe fn page_alloc_block_fast(page: *mut Page) -> *mut u8 {
    let block = (*page).free;
    if block.is_null() {
        return null_mut();
    }
    let next = block_next(&*page, block);
    (*page).free = next;
    (*page).used += 1;
    block as *mut u8
}

/// Full allocation slow path: collect any remotely freed blocks, fold in
/// `local_free`, extend capacity, or report OOM for this page (the caller
/// decides whether to retire the page or grow the heap).
pub unsafe fn page_alloc_block(page: *mut Page, stats: &Stats) -> *mut u8 {
    let fast = page_alloc_block_fast(page);
    if !fast.is_null() {
        return fast;
    }

    page_thread_free_collect(page);
    page_local_free_collect(page);
    if !(*page).free.is_null() {
        return page_alloc_block_fast(page);
    }

    if page_extend_free(page, stats) {
        return page_alloc_block_fast(page);
    }

    null_mut()
}

/// Splice `local_free` onto the front of `free`, preserving both chains'
/// existing order. Unlike `page_thread_free_collect` this never touches
/// `used` (the blocks were already debited when they were pushed onto
/// `local_free` in `page_free_block_local`).
pub unsafe fn page_local_free_collect(page: *mut Page) {
    if (*page).local_free.is_null() {
        return;
    }
    let head = (*page).local_free;
    (*page).local_free = null_mut();
    let mut tail = head;
    loop {
        let next = block_next(&*page, tail);
        if next.is_null() {
            break;
        }
        tail = next;
    }
    block_set_next(&*page, tail, (*page).free);
    (*page).free = head;
}

/// Carve `capacity..reserved` of a page's (already committed) block storage
/// into new free-list entries. Extension proceeds from the highest address
/// down so freshly extended blocks are handed out in roughly the same order
/// later allocations will touch them.
pub unsafe fn page_extend_free(page: *mut Page, stats: &Stats) -> bool {
    if (*page).capacity >= (*page).reserved {
        return false;
    }
    let bsize = (*page).block_size;
    if bsize == 0 {
        return false;
    }

    let extend = ((*page).reserved - (*page).capacity).min(MAX_EXTEND);
    if extend == 0 {
        return false;
    }

    let base = segment::page_data_start(page);
    let start_index = (*page).capacity as usize;

    let mut head = (*page).free;
    for i in (start_index..start_index + extend as usize).rev() {
        let block = base.add(i * bsize) as *mut Block;
        block_set_next(&*page, block, head);
        head = block;
    }
    (*page).free = head;
    (*page).capacity += extend;

    stat_increase(&stats.pages_extended, 1);
    true
}

/// Fold the atomic `thread_free` list into `local_free`, resetting it to
/// empty. Called by the owning thread before it trusts `used` to reflect
/// every block a remote thread has freed.
pub unsafe fn page_thread_free_collect(page: *mut Page) {
    let mut head = (*page).thread_free.0.load(Ordering::Acquire);
    loop {
        let (block, delayed) = ThreadFree::unpack(head);
        if block.is_null() {
            return;
        }
        let new_head = ThreadFree::pack(null_mut(), delayed);
        match (*page).thread_free.0.compare_exchange_weak(
            head,
            new_head,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(observed) => {
                head = observed;
                continue;
            }
        }
    }

    let (mut block, _) = ThreadFree::unpack(head);
    let mut freed = 0usize;
    while !block.is_null() {
        let next = block_next(&*page, block);
        block_set_next(&*page, block, (*page).local_free);
        (*page).local_free = block;
        block = next;
        freed += 1;
    }
    (*page).used = (*page).used.saturating_sub(freed);
}

/// Free a block known to belong to the calling thread's own page: splice
/// straight onto `local_free`.
pub unsafe fn page_free_block_local(page: *mut Page, block: *mut Block) {
    if OPTIONS.is_secure() && !block_in_page_bounds(page, block) {
        error::report(ErrorKind::InvalidPointer, block as usize);
        return;
    }
    if OPTIONS.is_secure() && is_on_free_list(&*page, block) {
        error::report(ErrorKind::DoubleFree, block as usize);
        return;
    }
    block_set_next(&*page, block, (*page).local_free);
    (*page).local_free = block;
    (*page).used -= 1;
}

/// Secure-mode double-free guard: a short linear scan of the page's current
/// free lists. Bounded by `MAX_SEARCH` so a pathological page can't make a
/// free call scan thousands of entries.
unsafe fn is_on_free_list(page: &Page, block: *mut Block) -> bool {
    let mut n = 0;
    let mut cur = page.free;
    while !cur.is_null() && n < MAX_SEARCH {
        if cur == block {
            return true;
        }
        cur = block_next(page, cur);
        n += 1;
    }
    cur = page.local_free;
    n = 0;
    while !cur.is_null() && n < MAX_SEARCH {
        if cur == block {
            return true;
        }
        cur = block_next(page, cur);
        n += 1;
    }
    false
}

/// Push a block onto a page's atomic `thread_free` list from a thread other
/// than its owner, or — if the page is in `UseDelayedFree` state — flip the
/// tag to `DelayedFreeing` instead, without touching `thread_free` at all.
/// These two outcomes are mutually exclusive within the same CAS attempt:
/// `block` is only ever spliced into one chain. Returns `true` when the tag
/// was flipped, meaning the caller now owns the promotion window and must
/// push `block` onto the heap's `thread_delayed_free` list itself (see
/// `remote::promote_to_delayed`) and then call `finish_delayed_freeing`;
/// returns `false` when `block` already landed on `thread_free` and there is
/// nothing further to do.
pub unsafe fn page_free_block_remote(page: *mut Page, block: *mut Block) -> bool {
    let mut head = (*page).thread_free.0.load(Ordering::Relaxed);
    loop {
        let (old_block, delayed) = ThreadFree::unpack(head);
        if delayed == Delayed::UseDelayedFree {
            let new_head = ThreadFree::pack(old_block, Delayed::DelayedFreeing);
            match (*page).thread_free.0.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => head = observed,
            }
        } else {
            block_set_next(&*page, block, old_block);
            let new_head = ThreadFree::pack(block, delayed);
            match (*page).thread_free.0.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(observed) => head = observed,
            }
        }
    }
}

/// Flip `DelayedFreeing` back to `UseDelayedFree` once the heap-level push
/// has completed, so future remote frees resume taking the fast CAS path.
pub unsafe fn finish_delayed_freeing(page: *mut Page) {
    let mut head = (*page).thread_free.0.load(Ordering::Relaxed);
    loop {
        let (block, delayed) = ThreadFree::unpack(head);
        debug_assert_eq!(delayed, Delayed::DelayedFreeing);
        let new_head = ThreadFree::pack(block, Delayed::UseDelayedFree);
        match (*page).thread_free.0.compare_exchange_weak(
            head,
            new_head,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => head = observed,
        }
    }
}

/// Set a page's delayed-free state to the terminal `NeverDelayedFree`
///.
pub unsafe fn set_never_delayed_free(page: *mut Page) {
    let mut head = (*page).thread_free.0.load(Ordering::Relaxed);
    loop {
        let (block, _) = ThreadFree::unpack(head);
        let new_head = ThreadFree::pack(block, Delayed::NeverDelayedFree);
        match (*page).thread_free.0.compare_exchange_weak(
            head,
            new_head,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => head = observed,
        }
    }
}

/// `true` once a page has no blocks in use anywhere (owner-side or
/// outstanding remote frees already collected). Callers must
/// `page_thread_free_collect` first if they want an up-to-date answer.
#[inline]
pub unsafe fn page_all_free(page: *mut Page) -> bool {
    (*page).used == 0
}

#[inline]
pub unsafe fn page_is_full(page: *mut Page) -> bool {
    (*page).flags.in_full
}

/// Exposed for `heap::is_allocated_block`, which walks `free` to tell
/// allocated blocks from free ones during `heap_visit_blocks`.
#[inline]
pub unsafe fn block_next_for_visit(page: &Page, block: *mut Block) -> *mut Block {
    block_next(page, block)
}

/// Reset a page's free lists and hand its slices back to the segment
/// allocator. The page is gone after this call; callers must already have
/// unlinked it from its heap's page queue.
pub unsafe fn page_free(page: *mut Page, tld: &mut segment::SegmentsTld, stats: &Stats) {
    (*page).heap = null_mut();
    (*page).free = null_mut();
    (*page).local_free = null_mut();
    (*page).thread_free.0.store(0, Ordering::Relaxed);
    (*page).used = 0;
    segment::segment_page_free(page, tld, stats);
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn make_test_page(block_size: usize, reserved: u16, cookie: usize) -> Page {
        let mut page: Page = core::mem::zeroed();
        page.block_size = block_size;
        page.reserved = reserved;
        page.cookie = cookie;
        page
    }

    #[test]
    fn cookie_roundtrips_through_block_next() {
        unsafe {
            let page = make_test_page(16, 4, 0xdead_beef);
            let mut storage_a: Block = Block { next: 0 };
            let mut storage_b: Block = Block { next: 0 };
            let a = &mut storage_a as *mut Block;
            let b = &mut storage_b as *mut Block;
            block_set_next(&page, a, b);
            assert_eq!(block_next(&page, a), b);
        }
    }
}
