//! End-to-end scenarios from SPEC_FULL.md §8 (S1-S6). Each test opens
//! a real datastore under a fresh `tempfile::tempdir()` rather than
//! the literal `/tmp/d` paths the spec scenario prose uses, so tests
//! can run concurrently and clean up after themselves.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metall::config::{CHUNK_SIZE, DEFAULT_MAX_SEGMENT_SIZE};
use metall::{Error, Manager};

fn store_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    dir.path().join(name)
}

/// S1 *create-small*: allocate, write, close; reopen and allocate
/// again; both regions remain independently usable and freeable.
#[test]
fn s1_create_small() {
    let root = tempfile::tempdir().expect("tempdir");
    let path = store_path(&root, "d");

    let manager = Manager::create(&path, DEFAULT_MAX_SEGMENT_SIZE).expect("create");
    let p = manager.allocate(10).expect("allocate p");
    unsafe {
        for i in 0..10u8 {
            *p.as_ptr().add(i as usize) = i;
        }
    }
    // The offset survives the later re-map at a new base even though
    // the raw pointer `p` does not: `close` unmaps the segment.
    let p_offset = manager.offset_of(p);
    manager.close().expect("close");

    let manager = Manager::open(&path).expect("reopen");
    let q = manager.allocate(10).expect("allocate q");
    let q_offset = manager.offset_of(q);
    assert_ne!(p_offset, q_offset, "a live allocation is never handed out twice");

    manager.deallocate(manager.resolve(p_offset));
    manager.deallocate(q);
    manager.close().expect("close");
}

/// S2 *named round-trip*: construct, close, reopen, find, destroy.
#[test]
fn s2_named_round_trip() {
    let root = tempfile::tempdir().expect("tempdir");
    let path = store_path(&root, "d");

    {
        let manager = Manager::create(&path, DEFAULT_MAX_SEGMENT_SIZE).expect("create");
        manager.construct::<u64>("n", 1, |_| 42u64).expect("construct");
        manager.close().expect("close");
    }

    let manager = Manager::open(&path).expect("open");
    let (ptr, _) = manager.find::<u64>("n").expect("find");
    assert_eq!(unsafe { *ptr.as_ptr() }, 42);

    manager.destroy::<u64>("n").expect("destroy");
    assert!(manager.find::<u64>("n").is_none(), "destroyed name is gone");
    manager.close().expect("close");
}

/// S3 *snapshot crash*: snapshot before a later mutation, then
/// "crash" (never call close on the live copy). The live datastore is
/// left inconsistent; the snapshot opens clean with the pre-mutation
/// value.
#[test]
fn s3_snapshot_crash() {
    let root = tempfile::tempdir().expect("tempdir");
    let live_path = store_path(&root, "d");
    let snap_path = store_path(&root, "s");

    let manager = Manager::create(&live_path, DEFAULT_MAX_SEGMENT_SIZE).expect("create");
    manager.construct::<i32>("x", 1, |_| 10i32).expect("construct");
    manager.snapshot(&snap_path).expect("snapshot");

    let (ptr, _) = manager.find::<i32>("x").unwrap();
    unsafe { *ptr.as_ptr() = 20 };
    std::mem::forget(manager); // simulate a crash: no close, no mark written

    let err = Manager::open(&live_path).unwrap_err();
    assert!(matches!(err, Error::Inconsistent { .. }), "live copy is unclean");

    let snap = Manager::open(&snap_path).expect("snapshot opens clean");
    let (ptr, _) = snap.find::<i32>("x").expect("find in snapshot");
    assert_eq!(unsafe { *ptr.as_ptr() }, 10, "snapshot predates the mutation");
    snap.close().expect("close");
}

/// S4 *large alloc*: an allocation larger than one chunk is
/// chunk-aligned, and a later small allocation does not land inside it.
#[test]
fn s4_large_alloc_is_chunk_aligned() {
    let root = tempfile::tempdir().expect("tempdir");
    let path = store_path(&root, "d");
    let manager = Manager::create(&path, DEFAULT_MAX_SEGMENT_SIZE).expect("create");

    let large = manager.allocate(4 * CHUNK_SIZE).expect("large allocate");
    let large_offset = manager.offset_of(large);
    assert_eq!(large_offset % CHUNK_SIZE, 0, "large allocations start on a chunk boundary");

    let small = manager.allocate(1).expect("small allocate");
    let small_offset = manager.offset_of(small);
    let large_end = large_offset + 4 * CHUNK_SIZE;
    assert!(
        small_offset < large_offset || small_offset >= large_end,
        "small allocation must not overlap the large run"
    );

    manager.deallocate(small);
    manager.deallocate(large);
    manager.close().expect("close");
}

/// S5 *fragmentation and coalesce*: freeing the middle of three
/// single-chunk runs leaves a hole that the next same-size allocation
/// reuses, lowest chunk index first.
#[test]
fn s5_fragmentation_reuses_lowest_free_chunk() {
    let root = tempfile::tempdir().expect("tempdir");
    let path = store_path(&root, "d");
    let manager = Manager::create(&path, DEFAULT_MAX_SEGMENT_SIZE).expect("create");

    let a = manager.allocate(CHUNK_SIZE).expect("a");
    let b = manager.allocate(CHUNK_SIZE).expect("b");
    let c = manager.allocate(CHUNK_SIZE).expect("c");
    let b_offset = manager.offset_of(b);

    manager.deallocate(b);

    let d = manager.allocate(CHUNK_SIZE).expect("d reuses the freed hole");
    assert_eq!(manager.offset_of(d), b_offset, "first-fit reuses the lowest free run");

    manager.deallocate(a);
    manager.deallocate(c);
    manager.deallocate(d);
    manager.close().expect("close");
}

/// S6 *multithread small*: concurrent allocate/deallocate of a single
/// small size from many threads never double-hands-out an address,
/// and the heap is fully drained at the end.
#[test]
fn s6_multithread_small() {
    let root = tempfile::tempdir().expect("tempdir");
    let path = store_path(&root, "d");
    let manager = Arc::new(Manager::create(&path, DEFAULT_MAX_SEGMENT_SIZE).expect("create"));

    let concurrent_bad_reuse = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let live = Arc::clone(&live);
            let bad = Arc::clone(&concurrent_bad_reuse);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let ptr = manager.allocate(16).expect("allocate");
                    let addr = ptr.as_ptr() as usize;
                    if !live.lock().unwrap().insert(addr) {
                        bad.fetch_add(1, Ordering::Relaxed);
                    }
                    live.lock().unwrap().remove(&addr);
                    manager.deallocate(ptr);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked");
    }

    assert_eq!(concurrent_bad_reuse.load(Ordering::Relaxed), 0, "no address handed out twice concurrently");
    assert!(manager.all_memory_deallocated(), "every allocation was freed");

    Arc::try_unwrap(manager)
        .unwrap_or_else(|_| panic!("manager still shared"))
        .close()
        .expect("close");
}
