//! Integration scenarios exercising cross-thread free and heap lifecycle
//! properties this allocator must hold under concurrent use.

use shardmalloc::{alloc, free, good_size, heap_alloc, heap_delete, heap_new, usable_size, with_thread_stats};

#[test]
fn small_alloc_roundtrip() {
    unsafe {
        let p = alloc(40);
        assert!(!p.is_null());
        assert!(usable_size(p) >= 40);
        core::ptr::write_bytes(p, 0x5a, 40);
        free(p);
    }
}

#[test]
fn medium_page_roundtrip_resolves_correct_block() {
    unsafe {
        // Past SMALL_OBJ_SIZE_MAX (8 KiB) but within MEDIUM_OBJ_SIZE_MAX
        // (128 KiB): served from a `Medium`-kind page, whose pointer
        // resolution back to its page/segment previously used the wrong
        // slice-index shift and could misidentify the owning page.
        let size = 20 * 1024;
        let p = alloc(size);
        assert!(!p.is_null());
        assert!(usable_size(p) >= size);
        core::ptr::write_bytes(p, 0x37, size);
        for i in 0..size {
            assert_eq!(*p.add(i), 0x37);
        }
        free(p);

        let q = alloc(size);
        assert!(!q.is_null());
        core::ptr::write_bytes(q, 0x42, size);
        free(q);
    }
}

#[test]
fn large_object_passthrough() {
    unsafe {
        let size = 8 * 1024 * 1024; // well past the large-object cutover
        let p = alloc(size);
        assert!(!p.is_null());
        assert!(usable_size(p) >= size);
        core::ptr::write_bytes(p, 0xee, size);
        free(p);
    }
}

#[test]
fn cross_thread_free_does_not_corrupt_owner_state() {
    unsafe {
        let p = alloc(64) as usize;
        core::ptr::write_bytes(p as *mut u8, 0x11, 64);

        let handle = std::thread::spawn(move || unsafe {
            // freed from a thread other than the one that allocated it.
            free(p as *mut u8);
        });
        handle.join().unwrap();

        // the allocating thread can keep allocating afterwards without the
        // remote free having corrupted its own free lists.
        let q = alloc(64);
        assert!(!q.is_null());
        free(q);
    }
}

#[test]
fn heap_destroy_with_live_blocks_does_not_panic() {
    unsafe {
        let h = heap_new();
        assert!(!h.is_null());
        for _ in 0..32 {
            let p = heap_alloc(h, 48);
            assert!(!p.is_null());
            // deliberately not freed: heap_delete below migrates it.
        }
        heap_delete(h);
    }
}

#[test]
fn good_size_is_at_least_the_request() {
    for size in [1usize, 17, 1000, 100_000] {
        assert!(good_size(size) >= size);
    }
}

#[test]
fn abandoned_segment_is_reclaimed_by_another_thread() {
    use core::sync::atomic::Ordering;

    // warm this thread's own segment bookkeeping first so the "before"
    // snapshot below isn't itself paying for a first-ever segment.
    unsafe {
        let warm = alloc(80);
        assert!(!warm.is_null());
        free(warm);
    }
    let before = with_thread_stats(|s| s.segments.current.load(Ordering::Relaxed));

    let handle = std::thread::spawn(|| unsafe {
        let mut ptrs = Vec::with_capacity(100);
        for _ in 0..100 {
            let p = alloc(80);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        // deliberately not freed: the thread exits with every block still
        // live, abandoning its segment for another thread to reclaim.
    });
    handle.join().unwrap();

    unsafe {
        let mut ptrs = Vec::with_capacity(100);
        for _ in 0..100 {
            let p = alloc(80);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0x61, 80);
            ptrs.push(p);
        }
        for p in ptrs {
            assert_eq!(*p, 0x61);
            free(p);
        }
    }

    let after = with_thread_stats(|s| s.segments.current.load(Ordering::Relaxed));
    // the adopted segment's pages are reused directly rather than this
    // thread reserving a fresh segment from the OS; if reclaim were dead
    // code, 100 more 80-byte blocks would need a whole new segment.
    assert!(after - before <= 1, "before={before} after={after}");
}

#[test]
fn many_small_allocations_from_many_threads() {
    let handles: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| unsafe {
                let mut ptrs = Vec::with_capacity(256);
                for i in 0..256 {
                    let p = alloc(16 + (i % 64));
                    assert!(!p.is_null());
                    ptrs.push(p);
                }
                for p in ptrs {
                    free(p);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
