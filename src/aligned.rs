//! Aligned-allocation overlay.
//!
//! Alignments at or below a bin's natural block alignment are served by the
//! ordinary allocation path outright. Larger alignments request extra
//! headroom, round the returned pointer up, and mark the page `has_aligned`
//! so `free`/`realloc`/`usable_size` know to round back down to the true
//! block start.

use crate::bin;
use crate::error::{self, ErrorKind};
use crate::heap::{self, Heap};
use crate::segment::{self, SegmentsTld};
use crate::stats::Stats;
use crate::types::Page;

use core::ptr::null_mut;

/// `alloc_aligned(size, align[, offset])`. `align` must be a
/// power of two; `offset` shifts the alignment target, matching
/// `aligned_at(offset)`.
pub unsafe fn heap_alloc_aligned(
    heap: *mut Heap,
    tld: &mut SegmentsTld,
    stats: &Stats,
    size: usize,
    align: usize,
    offset: usize,
) -> *mut u8 {
    if align == 0 || !align.is_power_of_two() {
        error::report(ErrorKind::Overflow, align);
        return null_mut();
    }

    if offset == 0 {
        let bsize = bin::good_size(size.max(1));
        if align <= bsize && bsize % align == 0 {
            return heap::heap_alloc(heap, tld, stats, size);
        }
    }

    let total = size
        .checked_add(align - 1)
        .and_then(|v| v.checked_add(offset));
    let total = match total {
        Some(t) => t,
        None => {
            error::report(ErrorKind::Overflow, size);
            return null_mut();
        }
    };

    let raw = heap::heap_alloc(heap, tld, stats, total);
    if raw.is_null() {
        return null_mut();
    }

    let target = (raw as usize + offset + align - 1) & !(align - 1);
    let aligned = (target - offset) as *mut u8;

    let page = segment::page_of_ptr(segment::segment_of_ptr(raw), raw);
    (*page).flags.has_aligned = true;
    aligned
}

/// Recover the true block start for a pointer that may have been bumped
/// forward by `heap_alloc_aligned`. A no-op unless the page has ever served
/// an aligned allocation.
#[inline]
pub unsafe fn resolve_block_start(page: *mut Page, ptr: *mut u8) -> *mut u8 {
    if !(*page).flags.has_aligned {
        return ptr;
    }
    let data_start = segment::page_data_start(page) as usize;
    let bsize = (*page).block_size;
    if bsize == 0 {
        return ptr;
    }
    let offset_in_page = (ptr as usize).saturating_sub(data_start);
    let block_index = offset_in_page / bsize;
    (data_start + block_index * bsize) as *mut u8
}

#[cfg(test)]
mod tests {
    #[test]
    fn alignment_targets_are_powers_of_two() {
        for a in [16usize, 64, 4096, 65536] {
            assert!(a.is_power_of_two());
        }
    }
}
