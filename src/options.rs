//! In-process options store.
//!
//! This is a typed, programmatic settings surface only: parsing the
//! `MIMALLOC_*`-style environment-variable text format is the excluded
//! "option/environment parsing" collaborator and lives outside
//! this crate. What remains in scope is the read-mostly storage the core
//! consults on its hot paths: one-shot init, then read-mostly
//! atomics, expressed as plain atomics rather than a lock so there are
//! no allocator-internal global locks on the fast paths.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct Options {
    pub show_errors: AtomicBool,
    pub show_stats: AtomicBool,
    pub verbose: AtomicBool,
    pub max_errors: AtomicUsize,
    pub max_warnings: AtomicUsize,
    pub reserve_huge_os_pages: AtomicUsize,
    pub reserve_huge_os_pages_at: AtomicUsize,
    pub reserve_os_memory: AtomicUsize,
    pub allow_large_os_pages: AtomicBool,
    pub purge_decommits: AtomicBool,
    pub purge_delay: AtomicUsize,
    pub purge_extend_delay: AtomicUsize,
    pub arena_reserve: AtomicUsize,
    pub arena_eager_commit: AtomicBool,
    pub eager_commit: AtomicBool,
    pub eager_commit_delay: AtomicUsize,
    pub use_numa_nodes: AtomicUsize,
    pub disallow_os_alloc: AtomicBool,
    pub limit_os_alloc: AtomicUsize,
    pub max_segment_reclaim: AtomicUsize,
    pub destroy_on_exit: AtomicBool,
    pub arena_purge_mult: AtomicUsize,
    pub abandoned_reclaim_on_free: AtomicBool,
    pub disallow_arena_alloc: AtomicBool,
    pub visit_abandoned: AtomicBool,
    pub retry_on_oom: AtomicBool,
    pub secure: AtomicUsize, // 0 = off, 1..4 select increasingly paranoid secure-mode levels
}

impl Options {
    pub const fn defaults() -> Options {
        Options {
            show_errors: AtomicBool::new(false),
            show_stats: AtomicBool::new(false),
            verbose: AtomicBool::new(false),
            max_errors: AtomicUsize::new(16),
            max_warnings: AtomicUsize::new(16),
            reserve_huge_os_pages: AtomicUsize::new(0),
            reserve_huge_os_pages_at: AtomicUsize::new(usize::MAX),
            reserve_os_memory: AtomicUsize::new(0),
            allow_large_os_pages: AtomicBool::new(false),
            purge_decommits: AtomicBool::new(true),
            purge_delay: AtomicUsize::new(10),
            purge_extend_delay: AtomicUsize::new(1),
            arena_reserve: AtomicUsize::new(1024 * 1024 * 1024),
            arena_eager_commit: AtomicBool::new(false),
            eager_commit: AtomicBool::new(true),
            eager_commit_delay: AtomicUsize::new(1),
            use_numa_nodes: AtomicUsize::new(0),
            disallow_os_alloc: AtomicBool::new(false),
            limit_os_alloc: AtomicUsize::new(0),
            max_segment_reclaim: AtomicUsize::new(crate::types::MAX_SEGMENT_RECLAIM),
            destroy_on_exit: AtomicBool::new(false),
            arena_purge_mult: AtomicUsize::new(1),
            abandoned_reclaim_on_free: AtomicBool::new(true),
            disallow_arena_alloc: AtomicBool::new(false),
            visit_abandoned: AtomicBool::new(false),
            retry_on_oom: AtomicBool::new(false),
            secure: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub fn is_enabled(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Relaxed)
    }
}

/// Process-wide option table: a single value shared by every thread.
pub static OPTIONS: Options = Options::defaults();

pub fn set_secure(level: usize) {
    OPTIONS.secure.store(level, Ordering::Relaxed);
}

pub fn secure_level() -> usize {
    OPTIONS.secure.load(Ordering::Relaxed)
}
