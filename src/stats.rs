//! Allocator statistics counters.
//!
//! The update algorithm (track allocated/freed/current/peak per counter)
//! stays simple; the set of
//! tracked counters is expanded to match mimalloc's own
//! `mi_stats_t`. Formatting/printing of these counters is the out-of-scope
//! "statistics formatting and printing" surface; only the raw
//! counters themselves are core.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> StatCount {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }
}

#[derive(Default)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub const fn new() -> StatCounter {
        StatCounter {
            total: AtomicI64::new(0),
            count: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Stats {
    pub segments: StatCount,
    pub pages: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub page_committed: StatCount,
    pub segments_abandoned: StatCount,
    pub segments_cache: StatCount,
    pub pages_abandoned: StatCount,
    pub pages_extended: StatCount,
    pub mmap_calls: StatCount,
    pub commit_calls: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub large: StatCount,
    pub malloc: StatCount,
    pub searches: StatCounter,
    pub page_no_retire: StatCounter,
}

impl Stats {
    pub const fn new() -> Stats {
        Stats {
            segments: StatCount::new(),
            pages: StatCount::new(),
            reserved: StatCount::new(),
            committed: StatCount::new(),
            reset: StatCount::new(),
            page_committed: StatCount::new(),
            segments_abandoned: StatCount::new(),
            segments_cache: StatCount::new(),
            pages_abandoned: StatCount::new(),
            pages_extended: StatCount::new(),
            mmap_calls: StatCount::new(),
            commit_calls: StatCount::new(),
            threads: StatCount::new(),
            huge: StatCount::new(),
            large: StatCount::new(),
            malloc: StatCount::new(),
            searches: StatCounter::new(),
            page_no_retire: StatCounter::new(),
        }
    }
}

impl Default for Stats {
    fn default() -> Stats {
        Stats::new()
    }
}

pub fn stat_increase(stat: &StatCount, amount: i64) {
    stat_update(stat, amount);
}

pub fn stat_decrease(stat: &StatCount, amount: i64) {
    stat_update(stat, -amount);
}

pub fn stat_update(stat: &StatCount, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = stat.current.fetch_add(amount, Ordering::Relaxed) + amount;
    stat.peak.fetch_max(current, Ordering::Relaxed);
    if amount > 0 {
        stat.allocated.fetch_add(amount, Ordering::Relaxed);
    } else {
        stat.freed.fetch_add(-amount, Ordering::Relaxed);
    }
}

/// Merge a (thread-exiting) thread's stats into the process-wide total. The
/// `current` counters are additive across threads; `peak` is a coarse
/// upper bound (sum of per-thread peaks), matching mimalloc's own
/// `stats_done` merge, which does not try to reconstruct a true global peak.
pub fn stats_merge(into: &Stats, from: &Stats) {
    merge_count(&into.segments, &from.segments);
    merge_count(&into.pages, &from.pages);
    merge_count(&into.reserved, &from.reserved);
    merge_count(&into.committed, &from.committed);
    merge_count(&into.reset, &from.reset);
    merge_count(&into.page_committed, &from.page_committed);
    merge_count(&into.segments_abandoned, &from.segments_abandoned);
    merge_count(&into.segments_cache, &from.segments_cache);
    merge_count(&into.pages_abandoned, &from.pages_abandoned);
    merge_count(&into.pages_extended, &from.pages_extended);
    merge_count(&into.mmap_calls, &from.mmap_calls);
    merge_count(&into.commit_calls, &from.commit_calls);
    merge_count(&into.threads, &from.threads);
    merge_count(&into.huge, &from.huge);
    merge_count(&into.large, &from.large);
    merge_count(&into.malloc, &from.malloc);
}

fn merge_count(into: &StatCount, from: &StatCount) {
    into.allocated
        .fetch_add(from.allocated.load(Ordering::Relaxed), Ordering::Relaxed);
    into.freed
        .fetch_add(from.freed.load(Ordering::Relaxed), Ordering::Relaxed);
    into.current
        .fetch_add(from.current.load(Ordering::Relaxed), Ordering::Relaxed);
    let peak = from.peak.load(Ordering::Relaxed);
    into.peak.fetch_max(peak, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_and_peak() {
        let s = StatCount::new();
        stat_increase(&s, 100);
        stat_increase(&s, 50);
        stat_decrease(&s, 30);
        assert_eq!(s.current.load(Ordering::Relaxed), 120);
        assert_eq!(s.peak.load(Ordering::Relaxed), 150);
        assert_eq!(s.allocated.load(Ordering::Relaxed), 150);
        assert_eq!(s.freed.load(Ordering::Relaxed), 30);
    }
}
