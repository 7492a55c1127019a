//! Segment allocator.
//!
//! Segments are `SEGMENT_SIZE`-aligned OS reservations carved into
//! `SEGMENT_SLICE_SIZE` slices. A `Page` struct placed at a slice's entry in
//! `Segment::slices` doubles as that slice's metadata: when `slice_count >
//! 0` the entry is the first slice of either a page in use or a free span;
//! `heap.is_null()` distinguishes a free span from an allocated page. This
//! follows mimalloc's own slice design, with spans and coalescing tracked
//! explicitly.
//!
//! Free spans are kept in `SEGMENT_BIN_MAX + 1` queues binned by size so a
//! first-fit search only has to look at a handful of size classes rather
//! than walk every free span in a segment.

use crate::os;
use crate::stats::{stat_decrease, stat_increase, Stats};
use crate::types::*;

use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Thread-local segment bookkeeping: the free-span queues and a small cache
/// of whole segments kept around after their last page was freed, so a
/// thread that frees and then reallocates a page of similar size does not
/// have to round-trip through the OS.
pub struct SegmentsTld {
    pub span_queues: [SpanQueue; SEGMENT_BIN_MAX + 1],
    pub count: usize,
    pub peak_count: usize,
    pub current_size: usize,
    pub peak_size: usize,
    pub cache: *mut Segment,
    pub cache_count: usize,
    pub cache_size: usize,
}

unsafe impl Send for SegmentsTld {}

impl SegmentsTld {
    pub const fn new() -> SegmentsTld {
        // `[SpanQueue::empty(); N]` needs `SpanQueue: Copy`, which it isn't
        // (it holds raw pointers we'd rather not accidentally duplicate);
        // write the array out explicitly instead.
        const EMPTY: SpanQueue = SpanQueue::empty();
        SegmentsTld {
            span_queues: [EMPTY; SEGMENT_BIN_MAX + 1],
            count: 0,
            peak_count: 0,
            current_size: 0,
            peak_size: 0,
            cache: null_mut(),
            cache_count: 0,
            cache_size: 0,
        }
    }
}

/// Map a free span's slice count to its queue bin. Bins widen geometrically
/// past the first few exact sizes so a segment with a handful of distinct
/// span sizes needs only a handful of non-empty queues.
fn slice_bin(slice_count: usize) -> usize {
    if slice_count == 0 {
        return 0;
    }
    if slice_count <= 8 {
        return slice_count;
    }
    if slice_count > SLICES_PER_SEGMENT {
        return SEGMENT_BIN_MAX;
    }
    let w = (slice_count - 1) as u32;
    let b = 31 - w.leading_zeros();
    let bin = 8 + ((b - 3) * 2) as usize + (((w >> (b - 1)) & 1) as usize);
    bin.min(SEGMENT_BIN_MAX)
}

#[inline]
unsafe fn slice_index(seg: *mut Segment, slice: *mut Page) -> usize {
    (slice as usize - (*seg).slices as usize) / core::mem::size_of::<Page>()
}

#[inline]
unsafe fn slice_at(seg: *mut Segment, index: usize) -> *mut Page {
    (*seg).slices.add(index)
}

unsafe fn span_queue_remove(tld: &mut SegmentsTld, bin: usize, slice: *mut Page) {
    let q = &mut tld.span_queues[bin];
    let prev = (*slice).prev;
    let next = (*slice).next;
    if !prev.is_null() {
        (*prev).next = next;
    } else {
        q.first = next;
    }
    if !next.is_null() {
        (*next).prev = prev;
    } else {
        q.last = prev;
    }
    (*slice).prev = null_mut();
    (*slice).next = null_mut();
}

unsafe fn span_queue_push(tld: &mut SegmentsTld, bin: usize, slice: *mut Page) {
    let q = &mut tld.span_queues[bin];
    (*slice).prev = q.last;
    (*slice).next = null_mut();
    if !q.last.is_null() {
        (*q.last).next = slice;
    } else {
        q.first = slice;
    }
    q.last = slice;
}

/// Mark `[start, start+count)` as one free span and queue it.
unsafe fn span_free_mark(tld: &mut SegmentsTld, seg: *mut Segment, start: usize, count: usize) {
    debug_assert!(count > 0);
    let head = slice_at(seg, start);
    core::ptr::write_bytes(head, 0, 1);
    (*head).slice_count = count as u32;
    (*head).slice_offset = 0;
    (*head).heap = null_mut();
    if count > 1 {
        let tail = slice_at(seg, start + count - 1);
        core::ptr::write_bytes(tail, 0, 1);
        (*tail).slice_offset = (count - 1) as u32;
    }
    span_queue_push(tld, slice_bin(count), head);
}

/// Try to merge a freed span with a free neighbor on either side, then queue
/// whatever is left as a single span.
unsafe fn span_free_coalesce(tld: &mut SegmentsTld, seg: *mut Segment, mut start: usize, mut count: usize) {
    let seg_usable_start = (*seg).segment_info_slices;
    let seg_usable_end = (*seg).segment_slices;

    // left neighbor: walk back to that span's head via slice_offset.
    if start > seg_usable_start {
        let left_tail = slice_at(seg, start - 1);
        let left_count = (*left_tail).slice_offset as usize + 1;
        let left_start = start - left_count;
        let left_head = slice_at(seg, left_start);
        if (*left_head).is_page_start() && (*left_head).heap.is_null() {
            span_queue_remove(tld, slice_bin((*left_head).slice_count as usize), left_head);
            start = left_start;
            count += left_count;
        }
    }

    // right neighbor
    if start + count < seg_usable_end {
        let right_head = slice_at(seg, start + count);
        if (*right_head).is_page_start() && (*right_head).heap.is_null() {
            let right_count = (*right_head).slice_count as usize;
            span_queue_remove(tld, slice_bin(right_count), right_head);
            count += right_count;
        }
    }

    span_free_mark(tld, seg, start, count);
}

/// First-fit search across the free-span bins for a span of at least
/// `need` slices.
unsafe fn span_queue_find_fit(tld: &mut SegmentsTld, need: usize) -> Option<(*mut Segment, *mut Page)> {
    let start_bin = slice_bin(need);
    for bin in start_bin..=SEGMENT_BIN_MAX {
        let mut probed = 0;
        let mut cur = tld.span_queues[bin].first;
        while !cur.is_null() {
            if (*cur).slice_count as usize >= need {
                let seg = segment_of_slice(cur);
                span_queue_remove(tld, bin, cur);
                return Some((seg, cur));
            }
            cur = (*cur).next;
            probed += 1;
            if probed >= MAX_SEARCH {
                break;
            }
        }
    }
    None
}

/// Recover the owning segment from a pointer to one of its slice entries.
/// Segments are `SEGMENT_SIZE`-aligned, so masking the slice-array address
/// down to that alignment lands on the segment header only when the header
/// itself lives at the front of the reservation, which `segment_reserve`
/// guarantees.
unsafe fn segment_of_slice(slice: *mut Page) -> *mut Segment {
    let seg_start = (slice as usize) & !SEGMENT_MASK;
    seg_start as *mut Segment
}

pub unsafe fn segment_of_ptr(p: *const u8) -> *mut Segment {
    ((p as usize) & !SEGMENT_MASK) as *mut Segment
}

/// Byte address of slice `index`'s block storage. Distinct from `slice_at`,
/// which indexes the compact `Page`-sized metadata array: block storage is
/// addressed in `SEGMENT_SLICE_SIZE` strides directly off the segment base.
#[inline]
unsafe fn slice_address(seg: *mut Segment, index: usize) -> *mut u8 {
    (seg as *mut u8).add(index * SEGMENT_SLICE_SIZE)
}

/// The start of a page's own block storage (as opposed to its metadata
/// entry in `Segment::slices`).
pub unsafe fn page_data_start(page: *mut Page) -> *mut u8 {
    let seg = segment_of_slice(page);
    if (*seg).kind == SegmentKind::Huge {
        return (seg as *mut u8).add(os::align_up(
            core::mem::size_of::<Segment>() + core::mem::size_of::<Page>(),
            os::os_page_size(),
        ));
    }
    slice_address(seg, slice_index(seg, page))
}

/// Total bytes of block storage backing a page.
pub unsafe fn page_data_size(page: *mut Page) -> usize {
    let seg = segment_of_slice(page);
    if (*seg).kind == SegmentKind::Huge {
        return (*seg).segment_size - (page_data_start(page) as usize - seg as usize);
    }
    (*page).slice_count as usize * SEGMENT_SLICE_SIZE
}

pub unsafe fn page_of_ptr(seg: *mut Segment, p: *const u8) -> *mut Page {
    // A huge segment holds exactly one page and its `slices` array is a
    // single entry (the data area is not sliced at all), so any pointer
    // inside it resolves directly without touching the slice array.
    if (*seg).kind == SegmentKind::Huge {
        return (*seg).slices;
    }
    // Slice metadata entries are always spaced `SEGMENT_SLICE_SIZE` apart,
    // regardless of how large the page occupying them is (a page may span
    // many slices; `page_shift` only records that page's own geometry, not
    // the slice array's). Using anything coarser than `SEGMENT_SLICE_SHIFT`
    // here under-counts the index for medium/large pages.
    let slice_idx = ((p as usize) - (seg as usize)) >> SEGMENT_SLICE_SHIFT;
    let mut entry = slice_at(seg, slice_idx.min((*seg).segment_slices - 1));
    while !(*entry).is_page_start() {
        entry = slice_at(seg, slice_idx - (*entry).slice_offset as usize);
    }
    entry
}

/// Reserve a fresh `SEGMENT_SIZE`-aligned segment from the OS (or pop one
/// from the thread's small segment cache) and initialize it as one large
/// free span.
unsafe fn segment_reserve(
    kind: SegmentKind,
    segment_size: usize,
    thread_id: usize,
    subproc: usize,
    tld: &mut SegmentsTld,
    stats: &Stats,
) -> *mut Segment {
    if kind == SegmentKind::Normal && !tld.cache.is_null() {
        let seg = tld.cache;
        tld.cache = (*seg).next;
        tld.cache_count -= 1;
        tld.cache_size -= (*seg).segment_size;
        (*seg).next = null_mut();
        (*seg).thread_id.store(thread_id, Ordering::Relaxed);
        (*seg).subproc = subproc;
        return seg;
    }

    let mem = os::os_alloc_aligned(segment_size, SEGMENT_SIZE, stats);
    if mem.is_null() {
        return null_mut();
    }
    let seg = mem as *mut Segment;

    let segment_slices = segment_size / SEGMENT_SLICE_SIZE;
    // the slice metadata array (one `Page`-sized entry per slice) lives right
    // after the `Segment` header; both are carved out of whole slices so
    // block storage for the first real page always starts on a slice
    // boundary.
    let slices_array_bytes = segment_slices * core::mem::size_of::<Page>();
    let header_bytes = core::mem::size_of::<Segment>() + slices_array_bytes;
    let info_slices = os::align_up(header_bytes, SEGMENT_SLICE_SIZE) / SEGMENT_SLICE_SIZE;
    let info_slices = info_slices.max(1);
    let slices_base = os::align_up(
        mem as usize + core::mem::size_of::<Segment>(),
        core::mem::align_of::<Page>(),
    );

    (*seg).next = null_mut();
    (*seg).prev = null_mut();
    (*seg).abandoned_next = AtomicPtr::new(null_mut());
    (*seg).abandoned_linked = AtomicBool::new(false);
    (*seg).mem_is_fixed = false;
    (*seg).mem_is_committed = true;
    (*seg).abandoned = 0;
    (*seg).used = 0;
    (*seg).capacity = 0;
    (*seg).cookie = (mem as usize) ^ 0x5bd1_e995;
    (*seg).segment_size = segment_size;
    (*seg).segment_slices = segment_slices;
    (*seg).segment_info_slices = info_slices;
    (*seg).allow_decommit = kind == SegmentKind::Normal;
    (*seg).commit_mask = u64::MAX;
    (*seg).kind = kind;
    (*seg).page_kind = PageKind::Small;
    (*seg).page_shift = SEGMENT_SLICE_SHIFT;
    (*seg).thread_id = AtomicUsize::new(thread_id);
    (*seg).subproc = subproc;
    (*seg).slice_entries = segment_slices;
    (*seg).slices = slices_base as *mut Page;

    // the slice entries overlapping the header/metadata region are never
    // handed out; zero them so `is_page_start` is false there.
    core::ptr::write_bytes((*seg).slices, 0, info_slices);

    stat_increase(&stats.segments, 1);
    stat_increase(&stats.reserved, segment_size as i64);

    if kind == SegmentKind::Normal {
        span_free_mark(tld, seg, info_slices, segment_slices - info_slices);
        tld.count += 1;
        tld.current_size += segment_size;
        tld.peak_size = tld.peak_size.max(tld.current_size);
        tld.peak_count = tld.peak_count.max(tld.count);
    }

    seg
}

fn required_slices(size: usize) -> usize {
    os::align_up(size, SEGMENT_SLICE_SIZE) / SEGMENT_SLICE_SIZE
}

/// Allocate a page of at least `block_size * reserve_count` usable bytes
/// with `page_kind`, creating a new segment if no existing free span fits
///.
pub unsafe fn segment_page_alloc(
    page_kind: PageKind,
    required_size: usize,
    thread_id: usize,
    subproc: usize,
    tld: &mut SegmentsTld,
    stats: &Stats,
) -> *mut Page {
    if page_kind == PageKind::Huge {
        return segment_huge_page_alloc(required_size, thread_id, subproc, stats);
    }

    let need = required_slices(required_size).max(1);
    let found = span_queue_find_fit(tld, need);
    let (seg, span_head) = match found {
        Some(v) => v,
        None => {
            let seg = segment_reserve(SegmentKind::Normal, SEGMENT_SIZE, thread_id, subproc, tld, stats);
            if seg.is_null() {
                return null_mut();
            }
            match span_queue_find_fit(tld, need) {
                Some(v) => v,
                None => return null_mut(),
            }
        }
    };

    let span_start = slice_index(seg, span_head);
    let span_count = (*span_head).slice_count as usize;

    // carve `need` slices off the front, re-queue the remainder as a
    // smaller free span.
    if span_count > need {
        span_free_mark(tld, seg, span_start + need, span_count - need);
    }

    let page = span_head;
    core::ptr::write_bytes(page, 0, 1);
    (*page).slice_count = need as u32;
    (*page).slice_offset = 0;
    (*page).heap = null_mut(); // set by the caller once it knows which heap owns this page
    (*page).is_committed = true;
    (*page).is_zero_init = true;
    (*page).is_zero = true;

    for i in 1..need {
        let slot = slice_at(seg, span_start + i);
        core::ptr::write_bytes(slot, 0, 1);
        (*slot).slice_offset = i as u32;
    }

    (*seg).used += 1;
    (*seg).capacity += 1;
    (*seg).page_kind = page_kind;
    (*seg).page_shift = match page_kind {
        PageKind::Small => SMALL_PAGE_SHIFT,
        PageKind::Medium => MEDIUM_PAGE_SHIFT,
        _ => SEGMENT_SLICE_SHIFT,
    };

    stat_increase(&stats.pages, 1);
    page
}

unsafe fn segment_huge_page_alloc(
    required_size: usize,
    thread_id: usize,
    subproc: usize,
    stats: &Stats,
) -> *mut Page {
    let header = os::align_up(core::mem::size_of::<Segment>() + core::mem::size_of::<Page>(), os::os_page_size());
    let segment_size = header + os::align_up(required_size, os::os_page_size());
    let mem = os::os_alloc_aligned(segment_size, SEGMENT_SIZE, stats);
    if mem.is_null() {
        return null_mut();
    }
    let seg = mem as *mut Segment;
    (*seg).next = null_mut();
    (*seg).prev = null_mut();
    (*seg).abandoned_next = AtomicPtr::new(null_mut());
    (*seg).abandoned_linked = AtomicBool::new(false);
    (*seg).mem_is_fixed = false;
    (*seg).mem_is_committed = true;
    (*seg).abandoned = 0;
    (*seg).used = 1;
    (*seg).capacity = 1;
    (*seg).cookie = (mem as usize) ^ 0x5bd1_e995;
    (*seg).segment_size = segment_size;
    (*seg).segment_slices = segment_size / SEGMENT_SLICE_SIZE;
    (*seg).segment_info_slices = 1;
    (*seg).allow_decommit = false;
    (*seg).commit_mask = u64::MAX;
    (*seg).kind = SegmentKind::Huge;
    (*seg).page_kind = PageKind::Huge;
    (*seg).page_shift = 0;
    (*seg).thread_id = AtomicUsize::new(thread_id);
    (*seg).subproc = subproc;
    (*seg).slice_entries = 1;
    (*seg).slices = (mem as usize + core::mem::size_of::<Segment>()) as *mut Page;

    let page = (*seg).slices;
    core::ptr::write_bytes(page, 0, 1);
    (*page).slice_count = 1;
    (*page).is_committed = true;
    (*page).is_zero_init = true;
    (*page).is_zero = true;

    stat_increase(&stats.segments, 1);
    stat_increase(&stats.pages, 1);
    stat_increase(&stats.huge, segment_size as i64);
    page
}

/// Return a page's slices to its segment's free spans, coalescing with
/// neighbors, and recycle or release the segment once it holds no pages.
pub unsafe fn segment_page_free(page: *mut Page, tld: &mut SegmentsTld, stats: &Stats) {
    let seg = segment_of_slice(page);

    if (*seg).kind == SegmentKind::Huge {
        let size = (*seg).segment_size;
        stat_decrease(&stats.segments, 1);
        stat_decrease(&stats.pages, 1);
        stat_decrease(&stats.huge, size as i64);
        os::os_free(seg as *mut u8, size, stats);
        return;
    }

    let start = slice_index(seg, page);
    let count = (*page).slice_count as usize;
    stat_decrease(&stats.pages, 1);
    (*seg).used -= 1;

    span_free_coalesce(tld, seg, start, count);

    if (*seg).used == 0 {
        segment_reclaim_or_release(seg, tld, stats);
    }
}

/// A segment with no pages in use is either kept in the small per-thread
/// cache (bounded by `SEGMENT_CACHE_MAX`/`SEGMENT_CACHE_FRACTION` of the
/// thread's current footprint) or returned to
/// the OS.
unsafe fn segment_reclaim_or_release(seg: *mut Segment, tld: &mut SegmentsTld, stats: &Stats) {
    // pull every free span this segment owns out of the bin queues; the
    // segment is leaving thread-local bookkeeping entirely either way.
    let mut idx = (*seg).segment_info_slices;
    while idx < (*seg).segment_slices {
        let slice = slice_at(seg, idx);
        if (*slice).is_page_start() && (*slice).heap.is_null() {
            span_queue_remove(tld, slice_bin((*slice).slice_count as usize), slice);
            idx += (*slice).slice_count as usize;
        } else {
            idx += 1;
        }
    }

    tld.count = tld.count.saturating_sub(1);
    tld.current_size = tld.current_size.saturating_sub((*seg).segment_size);

    let cache_budget = tld.current_size / SEGMENT_CACHE_FRACTION;
    if tld.cache_count < SEGMENT_CACHE_MAX && tld.cache_size < cache_budget.max(SEGMENT_SIZE) {
        (*seg).next = tld.cache;
        tld.cache = seg;
        tld.cache_count += 1;
        tld.cache_size += (*seg).segment_size;
        stat_increase(&stats.segments_cache, 1);
        return;
    }

    let size = (*seg).segment_size;
    stat_decrease(&stats.segments, 1);
    stat_decrease(&stats.reserved, size as i64);
    os::os_free(seg as *mut u8, size, stats);
}

/// Drop every cached segment back to the OS. Called on thread exit
/// once a thread's heaps are done with them.
pub unsafe fn segments_tld_release_cache(tld: &mut SegmentsTld, stats: &Stats) {
    let mut cur = tld.cache;
    while !cur.is_null() {
        let next = (*cur).next;
        let size = (*cur).segment_size;
        stat_decrease(&stats.segments_cache, 1);
        stat_decrease(&stats.reserved, size as i64);
        os::os_free(cur as *mut u8, size, stats);
        cur = next;
    }
    tld.cache = null_mut();
    tld.cache_count = 0;
    tld.cache_size = 0;
}

/// Attempt to claim an abandoned segment's ownership for the calling
/// thread. Used by the abandon/reclaim path; a single CAS so
/// two threads racing to reclaim the same segment cannot both succeed.
/// `SeqCst` on both sides of this CAS, not just acquire/release: this is
/// the one transition other threads need a single total order over (the
/// point a segment stops being reachable from the abandoned queue).
pub unsafe fn segment_try_claim(seg: *mut Segment, thread_id: usize) -> bool {
    (*seg)
        .thread_id
        .compare_exchange(0, thread_id, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Mark a segment abandoned: ownership reverts to "no thread" (thread_id
/// 0), making it eligible for any thread's reclaim scan. `SeqCst` to match
/// `segment_try_claim`'s transition back.
pub unsafe fn segment_mark_abandoned(seg: *mut Segment) {
    (*seg).thread_id.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_bin_is_monotonic_and_bounded() {
        let mut prev = 0;
        for n in 1..=SLICES_PER_SEGMENT {
            let b = slice_bin(n);
            assert!(b <= SEGMENT_BIN_MAX);
            assert!(b >= prev);
            prev = b;
        }
    }

    #[test]
    fn slice_bin_exact_for_small_counts() {
        for n in 1..=8 {
            assert_eq!(slice_bin(n), n);
        }
    }
}
