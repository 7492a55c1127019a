//! Cross-thread free and delayed-free promotion.
//!
//! A remote free is a single CAS on the target page's `thread_free` tag
//! (`page::page_free_block_remote`) that decides, per attempt, which of two
//! mutually exclusive things happens: ordinarily the block is spliced onto
//! `thread_free` itself; but if the page's delayed state is `UseDelayedFree`
//! the CAS instead flips the tag to `DelayedFreeing` and leaves `thread_free`
//! untouched, handing the calling thread exclusive ownership of the
//! promotion window. That thread alone then pushes the block onto the
//! owning heap's `thread_delayed_free` list and flips the tag back, giving
//! the owner bounded work to do on its next allocation instead of an
//! unbounded `thread_free` scan.

use crate::heap::Heap;
use crate::page;
use crate::tld::Tld;
use crate::types::*;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Free `block`, which lives on `page`. `page.heap`'s owning thread may be
/// any thread, including the caller's own (callers that already know they
/// are the owner should go through `heap::heap_free_block_local` instead;
/// this is the cross-thread path, which always goes through the atomic
/// `thread_free` list instead of the owner's plain `local_free`.
pub unsafe fn free_remote(page: *mut Page, block: *mut Block) {
    if page::page_free_block_remote(page, block) {
        promote_to_delayed(page, block);
    }
}

/// Push `block` onto the owning heap's `thread_delayed_free` list. Called
/// only by the single remote free whose `page_free_block_remote` CAS won
/// the `UseDelayedFree -> DelayedFreeing` transition, so no further
/// synchronization against other remote frees is needed here.
unsafe fn promote_to_delayed(page: *mut Page, block: *mut Block) {
    let heap = (*page).heap;
    if heap.is_null() || heap == ABANDONED_HEAP {
        return;
    }

    let mut head = (*heap).thread_delayed_free.0.load(Ordering::Relaxed);
    loop {
        let (old, _) = ThreadFree::unpack(head);
        (*block).next = old as usize;
        let new_head = ThreadFree::pack(block, Delayed::NoDelayedFree);
        match (*heap).thread_delayed_free.0.compare_exchange_weak(
            head,
            new_head,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => head = observed,
        }
    }

    page::finish_delayed_freeing(page);
}

/// Drain a heap's `thread_delayed_free` list: each block on it is a remote
/// free that arrived while its page was (or became) `FULL`. The owner
/// processes them as ordinary local frees so the page transitions back to
/// `PARTIAL` once it has room again.
pub unsafe fn heap_delayed_free_collect(heap: *mut Heap) {
    let head = (*heap)
        .thread_delayed_free
        .0
        .swap(ThreadFree::pack(core::ptr::null_mut(), Delayed::NoDelayedFree), Ordering::AcqRel);
    let (mut block, _) = ThreadFree::unpack(head);
    while !block.is_null() {
        let next = (*block).next as *mut Block;
        let page = crate::segment::page_of_ptr(
            crate::segment::segment_of_ptr(block as *const u8),
            block as *const u8,
        );
        crate::heap::heap_free_block_local(page, block);
        block = next;
    }
}

pub type DeferredFreeFn = fn(bool, u64, usize);

static DEFERRED_FREE: AtomicUsize = AtomicUsize::new(0);
static DEFERRED_ARG: AtomicUsize = AtomicUsize::new(0);

/// Register the single process-wide deferred-free callback.
/// Passing `None` clears it.
pub fn set_deferred_free(callback: Option<DeferredFreeFn>, arg: usize) {
    let value = match callback {
        Some(f) => f as usize,
        None => 0,
    };
    DEFERRED_FREE.store(value, Ordering::Relaxed);
    DEFERRED_ARG.store(arg, Ordering::Relaxed);
}

/// Invoke the registered callback, if any, guarded by `tld.recurse` so a
/// callback that itself allocates cannot recurse into this hook again
///.
pub unsafe fn run_deferred_free(tld: &mut Tld, force: bool) {
    if tld.recurse {
        return;
    }
    let raw = DEFERRED_FREE.load(Ordering::Relaxed);
    if raw == 0 {
        return;
    }
    let callback: DeferredFreeFn = core::mem::transmute::<usize, DeferredFreeFn>(raw);
    tld.recurse = true;
    callback(force, tld.heartbeat, DEFERRED_ARG.load(Ordering::Relaxed));
    tld.recurse = false;
}
