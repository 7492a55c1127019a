//! Core data structures: blocks, pages, segments, heaps and their tuning
//! constants. Layout mirrors mimalloc's own `mimalloc-types.h`,
//! generalized into a working implementation.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

#[cfg(target_pointer_width = "64")]
pub const INTPTR_SHIFT: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const INTPTR_SHIFT: usize = 2;

pub const INTPTR_SIZE: usize = 1 << INTPTR_SHIFT;

// ------------------------------------------------------
// Tuning parameters for segment, slice and page sizes.
// Sizes for 64-bit; halved on 32-bit via INTPTR_SHIFT.
// ------------------------------------------------------

pub const SEGMENT_SLICE_SHIFT: usize = 13 + INTPTR_SHIFT; // 64 KiB
pub const SEGMENT_SHIFT: usize = 10 + SEGMENT_SLICE_SHIFT; // 64 MiB

pub const SMALL_PAGE_SHIFT: usize = SEGMENT_SLICE_SHIFT; // 64 KiB
pub const MEDIUM_PAGE_SHIFT: usize = 3 + SMALL_PAGE_SHIFT; // 512 KiB

pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
pub const SEGMENT_MASK: usize = SEGMENT_SIZE - 1;
pub const SEGMENT_SLICE_SIZE: usize = 1 << SEGMENT_SLICE_SHIFT;
pub const SLICES_PER_SEGMENT: usize = SEGMENT_SIZE / SEGMENT_SLICE_SIZE;

pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;

pub const SMALL_OBJ_SIZE_MAX: usize = SMALL_PAGE_SIZE / 8; // 8 KiB
pub const MEDIUM_OBJ_SIZE_MAX: usize = MEDIUM_PAGE_SIZE / 4; // 128 KiB
pub const MEDIUM_OBJ_WSIZE_MAX: usize = MEDIUM_OBJ_SIZE_MAX / INTPTR_SIZE;

pub const LARGE_OBJ_SIZE_MAX: usize = SEGMENT_SIZE / 4; // 16 MiB
pub const LARGE_OBJ_WSIZE_MAX: usize = LARGE_OBJ_SIZE_MAX / INTPTR_SIZE;

/// Small fast-path direct table covers `1..=SMALL_WSIZE_MAX` words.
pub const SMALL_WSIZE_MAX: usize = 128;
pub const SMALL_SIZE_MAX: usize = SMALL_WSIZE_MAX * INTPTR_SIZE;

/// 73 bins spaced ~12.5% apart, bit-exact with mimalloc's `_mi_bin`.
pub const BIN_HUGE: usize = 73;
pub const BIN_FULL: usize = BIN_HUGE + 1;

/// Minimal alignment guaranteed for any allocation (must hold SSE registers etc).
pub const MAX_ALIGN_SIZE: usize = 16;

/// Commit granularity tracked by the per-segment commit bitmask.
/// Tied to the local large-page size; 2 MiB on x86.
pub const COMMIT_SIZE: usize = 2 * 1024 * 1024;
pub const COMMIT_UNITS_PER_SEGMENT: usize = SEGMENT_SIZE / COMMIT_SIZE;

const _ASSERT_COMMIT_BITS_FIT: () = assert!(COMMIT_UNITS_PER_SEGMENT <= 64);

/// How many consecutive empty-retire cycles a page survives before it is
/// returned to its segment. Kept as a small fixed tunable; 16 is the value
/// exposed here.
pub const RETIRE_CYCLES: u8 = 16;

/// Bound on how many abandoned segments a single allocation slow path will
/// try to reclaim.
pub const MAX_SEGMENT_RECLAIM: usize = 8;

/// Bound on how many pages a bin queue search visits before giving up
///.
pub const MAX_SEARCH: usize = 8;

pub const SEGMENT_CACHE_MAX: usize = 32;
pub const SEGMENT_CACHE_FRACTION: usize = 8;

// ------------------------------------------------------
// Free list encoding
// ------------------------------------------------------

/// A free block's header. When a block is free, `next` stores the
/// (possibly cookie-encoded) link to the next free block.
#[repr(C)]
pub struct Block {
    pub next: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Delayed {
    NoDelayedFree = 0,
    UseDelayedFree = 1,
    DelayedFreeing = 2,
    NeverDelayedFree = 3,
}

impl Delayed {
    #[inline]
    pub fn from_tag(tag: usize) -> Delayed {
        match tag & 0b11 {
            0 => Delayed::NoDelayedFree,
            1 => Delayed::UseDelayedFree,
            2 => Delayed::DelayedFreeing,
            _ => Delayed::NeverDelayedFree,
        }
    }
}

/// Tagged `thread_free` head: pointer in the high bits, `Delayed` state in
/// the low two. Single `AtomicUsize` so a remote free is one CAS.
#[derive(Default)]
pub struct ThreadFree(pub AtomicUsize);

impl ThreadFree {
    #[inline]
    pub fn pack(ptr: *mut Block, delayed: Delayed) -> usize {
        (ptr as usize) | (delayed as usize)
    }

    #[inline]
    pub fn unpack(value: usize) -> (*mut Block, Delayed) {
        ((value & !0b11) as *mut Block, Delayed::from_tag(value))
    }
}

#[derive(Clone, Copy, Default)]
pub struct PageFlags {
    pub in_full: bool,
    pub has_aligned: bool,
}

/// A page (one or more contiguous slices) holding blocks of a single size
/// class. Also serves as the generic "slice" metadata entry stored in a
/// segment's slice array: a non-page-start slice only uses `slice_offset`
/// (back-pointer, in slices, to the owning page's first slice) and leaves
/// the rest zeroed.
#[repr(C)]
pub struct Page {
    pub slice_count: u32, // slices spanned by this page; 0 if this is not a page start
    pub slice_offset: u32, // back-offset (in slices) to the page start; 0 at the start itself

    pub is_reset: bool,
    pub is_committed: bool,
    pub is_zero_init: bool,

    pub capacity: u16,
    pub reserved: u16,
    pub flags: PageFlags,
    pub is_zero: bool,

    pub free: *mut Block,
    pub cookie: usize,
    pub used: usize,

    pub local_free: *mut Block,
    pub thread_free: ThreadFree,

    pub block_size: usize,
    pub heap: *mut crate::heap::Heap,
    pub next: *mut Page,
    pub prev: *mut Page,

    /// Count of slow-path visits this page has survived while empty.
    /// Drives the `RETIRE_CYCLES` policy.
    pub retire_countdown: u8,
}

impl Page {
    #[inline]
    pub fn is_page_start(&self) -> bool {
        self.slice_count > 0
    }
}

/// Sentinel stored in `Page::heap` for a page abandoned by its dying
/// owner while still holding live blocks. Deliberately distinct from both
/// a real `*mut Heap` and `null` (which marks a genuine free span):
/// `span_free_coalesce`/`segment_reclaim_or_release` key off `heap.is_null()`
/// to decide what is safe to merge or hand back to the OS, and an abandoned
/// page's slice metadata (`slice_count`, `is_page_start()`) is left intact,
/// so reusing `null` here would make it indistinguishable from reclaimable
/// free space. Never dereferenced: every read of `Page::heap` must compare
/// against this constant before treating the value as a live `*mut Heap`.
pub const ABANDONED_HEAP: *mut crate::heap::Heap = 1 as *mut crate::heap::Heap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Small,  // blocks go into 64 KiB pages inside a segment
    Medium, // blocks go into 512 KiB pages inside a segment
    Large,  // a page spanning (almost) the whole segment, one block
    Huge,   // a dedicated segment sized to the single huge allocation
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegmentKind {
    Normal, // SEGMENT_SIZE, carved into slices/pages
    Huge,   // sized exactly to one huge allocation
}

/// Large allocated OS memory block, aligned to its own size, carved into
/// slices.
#[repr(C)]
pub struct Segment {
    pub next: *mut Segment, // segment cache / free-queue link
    pub prev: *mut Segment,
    pub abandoned_next: AtomicPtr<Segment>,
    /// `true` while this segment is physically linked into the abandoned
    /// stack. Guards `push_abandoned` against linking a node twice: a
    /// segment directly claimed via `try_reclaim_on_free` is never unlinked,
    /// so if its new owner later abandons it for real, pushing it again
    /// without this check would corrupt the stack's single `abandoned_next`
    /// chain.
    pub abandoned_linked: AtomicBool,

    pub mem_is_fixed: bool, // large OS pages: cannot decommit/reset/protect
    pub mem_is_committed: bool,

    pub abandoned: usize, // abandoned pages (<= used)
    pub used: usize,      // pages in use (<= capacity)
    pub capacity: usize,  // usable page slots (only meaningful for non-huge)
    pub cookie: usize,

    pub segment_size: usize,        // total bytes (may differ from SEGMENT_SIZE for huge)
    pub segment_slices: usize,      // slices in this segment
    pub segment_info_slices: usize, // slices reserved for segment+slice metadata

    pub allow_decommit: bool,
    pub commit_mask: u64, // one bit per COMMIT_SIZE unit

    pub kind: SegmentKind,
    pub page_kind: PageKind,
    pub page_shift: usize,      // 1 << page_shift == page size, for non-huge kinds
    pub thread_id: AtomicUsize, // owning thread id, or 0 == ABANDONED
    pub subproc: usize,         // isolation tag for abandon/reclaim partitioning

    pub slice_entries: usize, // entries actually in use in `slices`
    pub slices: *mut Page,    // `slice_entries` (<= SLICES_PER_SEGMENT) Page/slice entries
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Pages of one block size are held in a doubly linked queue.
pub struct PageQueue {
    pub first: *mut Page,
    pub last: *mut Page,
    pub block_size: usize,
}

impl PageQueue {
    pub const fn empty(block_size: usize) -> PageQueue {
        PageQueue {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
            block_size,
        }
    }
}

/// A span of free slices inside a segment, queued by slice-count bin.
pub struct SpanQueue {
    pub first: *mut Page,
    pub last: *mut Page,
    pub slice_count: usize,
}

impl SpanQueue {
    pub const fn empty() -> SpanQueue {
        SpanQueue {
            first: core::ptr::null_mut(),
            last: core::ptr::null_mut(),
            slice_count: 0,
        }
    }
}

pub const SEGMENT_BIN_MAX: usize = 35;

unsafe impl Send for Page {}
unsafe impl Sync for Page {}
