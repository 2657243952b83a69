//! Object cache (spec §4.G): a thread-local free-list in front of the
//! bin directory, refilled and flushed in batches to amortize the
//! global allocator mutex.
//!
//! Grounded on the teacher's `cache.rs` (`thread_local! CACHE` keyed
//! by class id, `Cache::grow`/`allocate`/`release`) and `magazine.rs`'s
//! batch-sized refill/flush contract. Generalized in two ways the
//! teacher doesn't need: the teacher has one process-wide allocator,
//! so its `CACHE` is keyed only by class id, and its thread caches are
//! only ever reclaimed by their owning thread's `Drop` impl. Multiple
//! `Manager` instances can coexist here (spec §9 "no hidden
//! singletons"), so the per-thread state is keyed first by a heap id
//! (handed out by [`crate::manager`]) and then by bin number; and a
//! heap's allocations must be fully reclaimable even if a worker
//! thread exits without ever calling back into this module (spec §8
//! invariant 10), so each thread's bins live behind an `Arc<Mutex<_>>`
//! registered in a process-wide table, not bare thread-local storage.
//! A thread-local only ever holds a *clone* of that `Arc`; when the
//! thread exits, the registry's clone keeps the bins (and anything
//! still cached in them) alive and reachable from
//! [`drain_all_threads`], which the manager calls under its own
//! allocator mutex at `close`/`sync`/`all_memory_deallocated` time.
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use smallvec::SmallVec;

use crate::size_class::BinNumber;

/// Small bins refill/flush in batches well under this many entries in
/// practice (`config::CACHE_BYTES_PER_BIN` divided by a small object's
/// size), so a stack-allocated inline buffer avoids a heap allocation
/// for the common case, the same role `SmallVec` plays in the
/// teacher's `cache.rs`.
type Stack = SmallVec<[usize; 16]>;

/// One thread's bins for one heap, shared between that thread's
/// thread-local handle and the heap's registry entry so the bins
/// outlive the thread that created them.
type SharedBins = Arc<Mutex<Vec<Stack>>>;

thread_local! {
    static LOCAL: RefCell<HashMap<usize, SharedBins>> = RefCell::new(HashMap::new());
}

lazy_static! {
    /// Every thread's `SharedBins` for every live heap, keyed by heap
    /// id. A thread registers itself here the first time it touches a
    /// given heap; entries are only ever removed by
    /// [`deregister_heap`], called when a heap closes.
    static ref REGISTRY: Mutex<HashMap<usize, Vec<SharedBins>>> = Mutex::new(HashMap::new());
}

fn shared_bins(heap_id: usize, num_bins: usize) -> SharedBins {
    LOCAL.with(|local| {
        let mut map = local.borrow_mut();
        map.entry(heap_id)
            .or_insert_with(|| {
                let bins: SharedBins = Arc::new(Mutex::new((0..num_bins).map(|_| Stack::new()).collect()));
                REGISTRY
                    .lock()
                    .expect("cache registry poisoned")
                    .entry(heap_id)
                    .or_default()
                    .push(bins.clone());
                bins
            })
            .clone()
    })
}

fn with_bins<R>(heap_id: usize, num_bins: usize, f: impl FnOnce(&mut Vec<Stack>) -> R) -> R {
    let bins = shared_bins(heap_id, num_bins);
    let mut guard = bins.lock().expect("thread cache poisoned");
    f(&mut guard)
}

/// Pops one cached offset for `bin`, or `None` on a cache miss. The
/// caller is responsible for refilling via [`refill`] under the
/// global allocator mutex.
pub fn pop(heap_id: usize, bin: BinNumber, num_bins: usize) -> Option<usize> {
    with_bins(heap_id, num_bins, |bins| bins[bin as usize].pop())
}

/// Appends a freshly fetched batch of offsets to `bin`'s stack.
pub fn refill(heap_id: usize, bin: BinNumber, num_bins: usize, offsets: Vec<usize>) {
    with_bins(heap_id, num_bins, |bins| bins[bin as usize].extend(offsets));
}

/// Pushes `offset` onto `bin`'s stack. If that would exceed
/// `capacity`, first drains half the stack and returns it so the
/// caller can flush it back to the global bin directory under the
/// allocator mutex — a batched flush, not one offset at a time.
pub fn push(
    heap_id: usize,
    bin: BinNumber,
    num_bins: usize,
    capacity: usize,
    offset: usize,
) -> Option<Vec<usize>> {
    with_bins(heap_id, num_bins, |bins| {
        let stack = &mut bins[bin as usize];
        let overflow = if stack.len() >= capacity {
            let half = (capacity / 2).max(1);
            Some(stack.drain(0..half).collect())
        } else {
            None
        };
        stack.push(offset);
        overflow
    })
}

fn drain_stacks(bins: &mut [Stack]) -> Vec<(BinNumber, Vec<usize>)> {
    bins.iter_mut()
        .enumerate()
        .filter(|(_, stack)| !stack.is_empty())
        .map(|(bin, stack)| (bin as BinNumber, stack.drain(..).collect()))
        .collect()
}

/// Drains every bin of the calling thread's cache for `heap_id`,
/// returning `(bin, offsets)` pairs for non-empty bins. Used by
/// `sync` to push cached slots back before serializing metadata; only
/// reaches this thread's own bins, so a heap touched by several
/// threads needs [`drain_all_threads`] to be fully reclaimed.
pub fn drain_current_thread(heap_id: usize) -> Vec<(BinNumber, Vec<usize>)> {
    LOCAL.with(|local| {
        let mut map = local.borrow_mut();
        match map.remove(&heap_id) {
            Some(bins) => drain_stacks(&mut bins.lock().expect("thread cache poisoned")),
            None => Vec::new(),
        }
    })
}

/// Drains every thread's cache for `heap_id`, merging same-bin offsets
/// together, by walking the heap's registry entry rather than relying
/// on each thread to drain itself. This is what lets `close` and
/// `all_memory_deallocated` reclaim allocations cached by worker
/// threads that have already exited (spec §8 invariant 10): those
/// threads' `SharedBins` stay alive in the registry even after their
/// thread-local handle is gone.
pub fn drain_all_threads(heap_id: usize) -> Vec<(BinNumber, Vec<usize>)> {
    let registry = REGISTRY.lock().expect("cache registry poisoned");
    let Some(per_thread) = registry.get(&heap_id) else {
        return Vec::new();
    };

    let mut merged: HashMap<BinNumber, Vec<usize>> = HashMap::new();
    for bins in per_thread {
        let mut guard = bins.lock().expect("thread cache poisoned");
        for (bin, offsets) in drain_stacks(&mut guard) {
            merged.entry(bin).or_default().extend(offsets);
        }
    }
    merged.into_iter().collect()
}

/// Drops the heap's registry entry entirely. Called once a heap is
/// closed and every cached offset has been drained back to global
/// state, so later reuse of the (monotonically increasing) heap id
/// space never sees stale registrations.
pub fn deregister_heap(heap_id: usize) {
    REGISTRY.lock().expect("cache registry poisoned").remove(&heap_id);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pop_on_empty_cache_is_a_miss() {
        assert_eq!(pop(1, 0, 4), None);
    }

    #[test]
    fn refill_then_pop_returns_lifo() {
        refill(2, 0, 4, vec![10, 11, 12]);
        assert_eq!(pop(2, 0, 4), Some(12));
        assert_eq!(pop(2, 0, 4), Some(11));
        assert_eq!(pop(2, 0, 4), Some(10));
        assert_eq!(pop(2, 0, 4), None);
    }

    #[test]
    fn push_flushes_half_on_overflow() {
        for offset in 0..4 {
            let flushed = push(3, 0, 4, 4, offset);
            assert!(flushed.is_none());
        }
        let flushed = push(3, 0, 4, 4, 99).expect("overflow should flush");
        assert_eq!(flushed, vec![0, 1]);
        assert_eq!(pop(3, 0, 4), Some(99));
        assert_eq!(pop(3, 0, 4), Some(3));
        assert_eq!(pop(3, 0, 4), Some(2));
        assert_eq!(pop(3, 0, 4), None);
    }

    #[test]
    fn drain_current_thread_empties_only_non_empty_bins() {
        refill(4, 0, 3, vec![1, 2]);
        refill(4, 2, 3, vec![7]);
        let mut drained = drain_current_thread(4);
        drained.sort_by_key(|(bin, _)| *bin);
        assert_eq!(drained, vec![(0, vec![1, 2]), (2, vec![7])]);
        assert_eq!(pop(4, 0, 3), None);
    }

    #[test]
    fn distinct_heap_ids_do_not_share_state() {
        refill(10, 0, 1, vec![42]);
        assert_eq!(pop(11, 0, 1), None);
        assert_eq!(pop(10, 0, 1), Some(42));
    }

    #[test]
    fn drain_all_threads_reclaims_offsets_left_by_an_exited_thread() {
        let heap_id = 20;
        let handle = std::thread::spawn(move || {
            refill(heap_id, 0, 2, vec![100, 101]);
            refill(heap_id, 1, 2, vec![200]);
        });
        handle.join().expect("worker thread panicked");

        // The worker thread is gone and never drained itself; its
        // bins must still be reachable from the registry.
        let mut drained = drain_all_threads(heap_id);
        drained.sort_by_key(|(bin, _)| *bin);
        assert_eq!(drained, vec![(0, vec![100, 101]), (1, vec![200])]);

        // A second drain finds nothing left.
        assert_eq!(drain_all_threads(heap_id), Vec::new());
        deregister_heap(heap_id);
    }

    #[test]
    fn drain_all_threads_merges_several_threads_sharing_a_bin() {
        let heap_id = 21;
        let handles: Vec<_> = (0..3)
            .map(|i| std::thread::spawn(move || refill(heap_id, 0, 1, vec![i])))
            .collect();
        for h in handles {
            h.join().expect("worker thread panicked");
        }

        let drained = drain_all_threads(heap_id);
        assert_eq!(drained.len(), 1);
        let (bin, mut offsets) = drained.into_iter().next().unwrap();
        assert_eq!(bin, 0);
        offsets.sort();
        assert_eq!(offsets, vec![0, 1, 2]);
        deregister_heap(heap_id);
    }
}
