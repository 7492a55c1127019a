//! Thread-local context and process/thread lifecycle.
//!
//! Each thread owns a backing heap (the non-destructible default), a
//! segment cache, a heartbeat counter and the `recurse` guard for the
//! deferred-free hook. Realized with `std::thread_local!` rather than an
//! "empty sentinel + explicit heap_init/heap_done"
//! dance: `thread_local!`'s own lazy-init and `Drop`-on-exit already give us
//! the two properties that dance was working around (no access
//! before first use, a destructor that runs once per thread), so the
//! sentinel heap and the `heap_is_initialized` checks it required are gone
//! rather than carried forward as dead weight.

use crate::abandon;
use crate::heap::Heap;
use crate::options::OPTIONS;
use crate::os;
use crate::remote;
use crate::segment::{self, SegmentsTld};
use crate::stats::{stats_merge, Stats};

use core::cell::{Cell, UnsafeCell};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-thread data mirroring mimalloc's own
/// `mi_tld_t`: heartbeat, the re-entrancy guard for the deferred-free hook,
/// a back-pointer to the thread's backing heap, and the segment/stats
/// bookkeeping those lower modules already expect to be handed explicitly.
pub struct Tld {
    pub heartbeat: u64,
    pub recurse: bool,
    pub heap_backing: *mut Heap,
    pub segments: SegmentsTld,
    pub stats: Stats,
}

impl Tld {
    fn new(heap_backing: *mut Heap) -> Tld {
        Tld {
            heartbeat: 0,
            recurse: false,
            heap_backing,
            segments: SegmentsTld::new(),
            stats: Stats::new(),
        }
    }
}

/// A heap created via `heap_new`/`heap_new_in_arena`, distinct from the
/// thread's backing heap. Allocated straight from the OS (`os::os_alloc`)
/// rather than through `Box`, so creating a heap never recurses back into
/// this crate's own `GlobalAlloc` impl when it is installed as
/// `#[global_allocator]`.
struct ExtraHeapNode {
    heap: Heap,
    next: *mut ExtraHeapNode,
}

struct ThreadState {
    id: usize,
    backing: UnsafeCell<Heap>,
    tld: UnsafeCell<Tld>,
    default: Cell<*mut Heap>,
    extra_heaps: Cell<*mut ExtraHeapNode>,
}

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

/// Totals merged in from every thread that has already exited. A thread's own `Tld::stats` remains
/// the live view for as long as it runs.
static PROCESS_STATS: Stats = Stats::new();

impl ThreadState {
    fn new() -> ThreadState {
        process_init();
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let seed = (id as usize)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (&NEXT_THREAD_ID as *const _ as usize);
        let cookie = seed | 1;
        let random = seed.rotate_left(17);
        let backing = UnsafeCell::new(Heap::new(id, cookie, random, None, 0));
        let backing_ptr = backing.get();
        ThreadState {
            id,
            backing,
            tld: UnsafeCell::new(Tld::new(backing_ptr)),
            default: Cell::new(backing_ptr),
            extra_heaps: Cell::new(null_mut()),
        }
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        unsafe { thread_done(self) }
    }
}

std::thread_local! {
    static STATE: ThreadState = ThreadState::new();
}

/// The heap `alloc`/`free` use when no explicit heap is named.
pub fn default_heap() -> *mut Heap {
    STATE.with(|s| s.default.get())
}

/// `heap_set_default`: install `heap` as the calling thread's
/// default, returning the previous one.
pub fn set_default_heap(heap: *mut Heap) -> *mut Heap {
    STATE.with(|s| {
        let prev = s.default.get();
        s.default.set(heap);
        prev
    })
}

/// `heap_get_backing`: the thread's non-destructible default.
pub fn backing_heap() -> *mut Heap {
    STATE.with(|s| s.backing.get())
}

pub fn thread_id() -> usize {
    STATE.with(|s| s.id)
}

/// Run `f` with the calling thread's `Tld`. Every core entry point that
/// needs segment/stats bookkeeping goes through this rather than holding a
/// `Tld` reference across a call boundary, since `Tld` never leaves its
/// owning thread.
pub fn with_tld<R>(f: impl FnOnce(&mut Tld) -> R) -> R {
    STATE.with(|s| unsafe { f(&mut *s.tld.get()) })
}

/// `heap_new_in_arena`: allocate a fresh, user-owned heap in the calling
/// thread's own `subproc` (tag `0`, the only one a thread belongs to unless
/// it was created with `heap_new_in_subproc`).
pub unsafe fn heap_new_in_arena(arena_id: Option<usize>) -> *mut Heap {
    heap_new_in_subproc(0, arena_id)
}

/// `heap_new_in_subproc`: like `heap_new_in_arena`, but the new heap (and
/// every segment it allocates fresh) carries `subproc` as its isolation
/// tag, so only other heaps tagged with the same value can ever reclaim its
/// abandoned segments.
pub unsafe fn heap_new_in_subproc(subproc: usize, arena_id: Option<usize>) -> *mut Heap {
    heap_new_ex(subproc, true, arena_id)
}

/// `heap_new_ex(tag, allow_destroy, arena_id)`: full constructor backing
/// both `heap_new`/`heap_new_in_arena` (`allow_destroy = true`) and any
/// heap meant to double as a reclaim target for abandoned segments
/// (`allow_destroy = false`). Mirrors mimalloc's own trade-off: a heap that
/// may adopt pages from a thread that has already gone away cannot also be
/// bulk-destroyed, since the caller never allocated those pages itself and
/// has no business discarding them outright.
pub unsafe fn heap_new_ex(subproc: usize, allow_destroy: bool, arena_id: Option<usize>) -> *mut Heap {
    let heap = heap_new_raw(subproc, arena_id);
    if !heap.is_null() {
        (*heap).no_reclaim = allow_destroy;
    }
    heap
}

unsafe fn heap_new_raw(subproc: usize, arena_id: Option<usize>) -> *mut Heap {
    STATE.with(|s| {
        let stats = &(*s.tld.get()).stats;
        let mem = os::os_alloc(core::mem::size_of::<ExtraHeapNode>(), stats);
        if mem.is_null() {
            return null_mut();
        }
        let node = mem as *mut ExtraHeapNode;
        let seed = (mem as usize).wrapping_mul(0x1b87_3593) ^ s.id;
        core::ptr::write(
            node,
            ExtraHeapNode {
                heap: Heap::new(s.id, seed | 1, seed.rotate_left(11), arena_id, subproc),
                next: s.extra_heaps.get(),
            },
        );
        s.extra_heaps.set(node);
        &mut (*node).heap as *mut Heap
    })
}

/// Unlink and free the `ExtraHeapNode` wrapping `heap` (called once
/// `heap_destroy`/`heap_delete` has already emptied its page queues). A
/// no-op if `heap` is the thread's backing heap, which has no node to free.
pub unsafe fn release_extra_heap(heap: *mut Heap) {
    STATE.with(|s| {
        if heap == s.backing.get() {
            return;
        }
        let mut prev: *mut ExtraHeapNode = null_mut();
        let mut cur = s.extra_heaps.get();
        while !cur.is_null() {
            if &mut (*cur).heap as *mut Heap == heap {
                if prev.is_null() {
                    s.extra_heaps.set((*cur).next);
                } else {
                    (*prev).next = (*cur).next;
                }
                let stats = &(*s.tld.get()).stats;
                os::os_free(cur as *mut u8, core::mem::size_of::<ExtraHeapNode>(), stats);
                return;
            }
            prev = cur;
            cur = (*cur).next;
        }
    });
}

/// Called once per allocation that reaches the heap's slow path. Bumps the heartbeat, runs the deferred-free
/// callback, drains the default heap's delayed-free list, and makes one
/// opportunistic attempt at reclaiming an abandoned segment.
pub fn on_allocation_slow_path() {
    STATE.with(|s| unsafe {
        let tld = &mut *s.tld.get();
        tld.heartbeat = tld.heartbeat.wrapping_add(1);
        remote::run_deferred_free(tld, false);

        let heap = s.default.get();
        if heap.is_null() {
            return;
        }
        remote::heap_delayed_free_collect(heap);
        if OPTIONS.abandoned_reclaim_on_free.load(Ordering::Relaxed) {
            let max = OPTIONS.max_segment_reclaim.load(Ordering::Relaxed);
            abandon::reclaim_on_alloc(heap, s.id, max);
        }
    })
}

/// Thread-exit cleanup: abandon every heap's
/// still-live pages, free the ones with nothing left on them, release
/// cached segments, and merge this thread's stats into the process total.
unsafe fn thread_done(state: &mut ThreadState) {
    let tld = &mut *state.tld.get();

    let mut cur = state.extra_heaps.get();
    while !cur.is_null() {
        let next = (*cur).next;
        let heap = &mut (*cur).heap as *mut Heap;
        abandon::abandon_heap_pages(heap, &mut tld.segments, &tld.stats);
        os::os_free(
            cur as *mut u8,
            core::mem::size_of::<ExtraHeapNode>(),
            &tld.stats,
        );
        cur = next;
    }
    state.extra_heaps.set(null_mut());

    abandon::abandon_heap_pages(state.backing.get(), &mut tld.segments, &tld.stats);
    segment::segments_tld_release_cache(&mut tld.segments, &tld.stats);

    stats_merge(&PROCESS_STATS, &tld.stats);
}

static PROCESS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Runs once, before any thread's first allocation. `thread_local!`'s lazy construction of
/// `STATE` already guarantees this happens exactly once even under
/// concurrent first-touch from multiple threads, so there is no separate
/// DllMain/constructor-attribute dance to
/// reproduce here: the first `ThreadState::new()` anywhere *is* the process
/// init call.
fn process_init() {
    if PROCESS_INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    os::os_init(OPTIONS.allow_large_os_pages.load(Ordering::Relaxed));

    #[cfg(unix)]
    unsafe {
        extern "C" fn run_process_done() {
            process_done();
        }
        libc::atexit(run_process_done);
    }
}

/// Process-exit hook. Per-thread abandonment
/// already happened as each thread's `ThreadState` dropped; this only
/// covers `destroy_on_exit`, which additionally wants the still-running
/// (i.e. main) thread's own heap torn down rather than left for its
/// `Drop`, which may run after `atexit` handlers on some platforms.
fn process_done() {
    static DONE: AtomicBool = AtomicBool::new(false);
    if DONE.swap(true, Ordering::AcqRel) {
        return;
    }
    if OPTIONS.destroy_on_exit.load(Ordering::Relaxed) {
        with_tld(|tld| unsafe {
            segment::segments_tld_release_cache(&mut tld.segments, &tld.stats);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heap_is_backing_heap_on_fresh_thread() {
        assert_eq!(default_heap(), backing_heap());
    }

    #[test]
    fn set_default_heap_returns_previous() {
        let prev = default_heap();
        let prev2 = set_default_heap(prev);
        assert_eq!(prev, prev2);
    }
}
