//! Chunk directory (spec §4.E): per-chunk metadata indexed by chunk
//! number. Every chunk is free, a small-object host for one bin, or
//! part of a large-object run.
//!
//! Grounded on the teacher's `class.rs` global `ClassInfo` registry
//! (one entry per size class, looked up by index) generalized from a
//! fixed compile-time class list to a dynamic per-chunk array, plus
//! `mill.rs`'s `ChunkMetadata` (one metadata record per carved range).
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::io::Write;

use crate::bitset::MultilayerBitset;
use crate::config::CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::size_class::{self, BinNumber};

/// What a freed slot transition means for the caller: whether the
/// chunk needs to move between the bin directory and the free pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFreedTransition {
    /// The chunk still has some slots occupied and some free; no
    /// directory change needed.
    StillPartial,
    /// The chunk went from full to partially occupied: it must be
    /// (re)inserted into its bin's bin directory entry.
    BecameNonFull,
    /// The chunk has no occupied slots left: it must be removed from
    /// the bin directory and returned to the free pool.
    BecameEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAllocResult {
    Allocated(usize),
    Full,
}

#[derive(Debug)]
enum ChunkState {
    Free,
    /// Permanently unavailable to the allocator: chunk 0 holds the
    /// segment header (spec §3/§9) and must never be handed out, so it
    /// is carved out of the free pool at `create` time and stays this
    /// way for the life of the datastore.
    Reserved,
    SmallHost {
        bin: BinNumber,
        num_slots: usize,
        occupied: usize,
        bitset: MultilayerBitset,
    },
    LargeHead {
        bin: BinNumber,
        run_len: usize,
    },
    LargeContinuation,
}

pub struct ChunkDirectory {
    entries: Vec<ChunkState>,
}

impl ChunkDirectory {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn num_chunks(&self) -> usize {
        self.entries.len()
    }

    /// Grows the directory to cover `num_chunks` chunks, marking any
    /// newly added ones free. Called whenever the segment grows.
    pub fn ensure_len(&mut self, num_chunks: usize) {
        while self.entries.len() < num_chunks {
            self.entries.push(ChunkState::Free);
        }
    }

    pub fn is_free(&self, chunk: usize) -> bool {
        matches!(self.entries[chunk], ChunkState::Free)
    }

    /// Permanently removes `chunk` from the free pool. Used once, at
    /// datastore creation, to carve out the chunk holding the segment
    /// header (spec §3/§9) so `allocate` can never hand it out.
    pub fn reserve(&mut self, chunk: usize) {
        debug_assert!(self.is_free(chunk));
        self.entries[chunk] = ChunkState::Reserved;
    }

    pub fn bin_of(&self, chunk: usize) -> Option<BinNumber> {
        match &self.entries[chunk] {
            ChunkState::SmallHost { bin, .. } => Some(*bin),
            ChunkState::LargeHead { bin, .. } => Some(*bin),
            _ => None,
        }
    }

    pub fn occupied(&self, chunk: usize) -> usize {
        match &self.entries[chunk] {
            ChunkState::SmallHost { occupied, .. } => *occupied,
            _ => 0,
        }
    }

    pub fn num_slots(&self, chunk: usize) -> usize {
        match &self.entries[chunk] {
            ChunkState::SmallHost { num_slots, .. } => *num_slots,
            _ => 0,
        }
    }

    /// Converts a free chunk into a small-object host for `bin`,
    /// allocating a multilayer bitset sized for its slot count.
    pub fn mark_small_host(&mut self, chunk: usize, bin: BinNumber) {
        debug_assert!(self.is_free(chunk));
        let object_size = size_class::size_of_bin(bin);
        let num_slots = CHUNK_SIZE / object_size;
        let mut bitset = MultilayerBitset::new();
        bitset.allocate(num_slots);
        self.entries[chunk] = ChunkState::SmallHost {
            bin,
            num_slots,
            occupied: 0,
            bitset,
        };
    }

    /// Marks `chunk_head .. chunk_head + k` as one large-object run.
    pub fn mark_large_run(&mut self, chunk_head: usize, k: usize, bin: BinNumber) {
        debug_assert!(k >= 1);
        for c in chunk_head..chunk_head + k {
            debug_assert!(self.is_free(c));
        }
        self.entries[chunk_head] = ChunkState::LargeHead { bin, run_len: k };
        for c in chunk_head + 1..chunk_head + k {
            self.entries[c] = ChunkState::LargeContinuation;
        }
    }

    /// Returns the run length of the large-object run headed at
    /// `chunk_head`, clearing it back to free chunks.
    pub fn mark_free_run(&mut self, chunk_head: usize) -> usize {
        let run_len = match &self.entries[chunk_head] {
            ChunkState::LargeHead { run_len, .. } => *run_len,
            _ => panic!("mark_free_run called on a non-head chunk"),
        };
        for c in chunk_head..chunk_head + run_len {
            self.entries[c] = ChunkState::Free;
        }
        run_len
    }

    /// Allocates the lowest-numbered free slot in `chunk`, which must
    /// currently be a small-object host.
    #[ensures(self.occupied(chunk) <= self.num_slots(chunk),
              "occupied count never exceeds the chunk's slot count")]
    pub fn allocate_slot(&mut self, chunk: usize) -> SlotAllocResult {
        match &mut self.entries[chunk] {
            ChunkState::SmallHost {
                num_slots,
                occupied,
                bitset,
                ..
            } => {
                if *occupied >= *num_slots {
                    return SlotAllocResult::Full;
                }
                let slot = bitset.find_and_set(*num_slots);
                *occupied += 1;
                SlotAllocResult::Allocated(slot)
            }
            _ => panic!("allocate_slot called on a non-small-host chunk"),
        }
    }

    /// Frees `slot_index` within `chunk`'s bitmap and reports whether
    /// the chunk should change directory membership.
    #[requires(self.occupied(chunk) > 0, "cannot free a slot in a chunk with nothing occupied")]
    pub fn free_slot(&mut self, chunk: usize, slot_index: usize) -> SlotFreedTransition {
        match &mut self.entries[chunk] {
            ChunkState::SmallHost {
                num_slots,
                occupied,
                bitset,
                ..
            } => {
                let was_full = *occupied == *num_slots;
                bitset.reset(*num_slots, slot_index);
                *occupied -= 1;

                if *occupied == 0 {
                    SlotFreedTransition::BecameEmpty
                } else if was_full {
                    SlotFreedTransition::BecameNonFull
                } else {
                    SlotFreedTransition::StillPartial
                }
            }
            _ => panic!("free_slot called on a non-small-host chunk"),
        }
    }

    /// Releases a chunk whose occupancy just reached zero, returning
    /// it to the free pool, and frees its bitset storage.
    pub fn mark_free(&mut self, chunk: usize) {
        let num_slots = self.num_slots(chunk);
        if let ChunkState::SmallHost { bitset, .. } = &mut self.entries[chunk] {
            bitset.free(num_slots);
        }
        self.entries[chunk] = ChunkState::Free;
    }

    /// Finds the lowest-indexed run of `k` consecutive free chunks
    /// (first-fit by chunk index, spec §4.E).
    pub fn find_free_large_run(&self, k: usize) -> Option<usize> {
        let mut run_start = None;
        let mut run_len = 0usize;
        for (i, entry) in self.entries.iter().enumerate() {
            if matches!(entry, ChunkState::Free) {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len >= k {
                    return run_start;
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }
        None
    }

    /// True iff no chunk is a small-object host or part of a large
    /// run (spec §8 invariant 10, "all memory deallocated"). The
    /// reserved header chunk is never "free" but doesn't count as
    /// live allocator state either.
    pub fn all_free(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e, ChunkState::Free | ChunkState::Reserved))
    }

    /// Writes one line per chunk: `<chunk_no> <kind> <bin> <count> <bitmap>`.
    /// `kind` is `F` (free), `R` (reserved), `S` (small host), `H`
    /// (large head), or `C` (large continuation). For a small host, `count` is the occupied
    /// slot count and `bitmap` is its leaf bitset words as comma-joined
    /// hex; for a large head, `count` is the run length. Persisting the
    /// leaf words (not just the occupied count) is what lets `open`
    /// reconstruct exactly which slots were live — the on-disk layout
    /// in spec §6 only names "state, bin, occupied count" for this
    /// file, but that's insufficient to rebuild per-slot occupancy, so
    /// this implementation extends the record with the bitmap (spec §6
    /// leaves exact schema details to the implementer for cases like
    /// this).
    pub fn serialize(&self, out: &mut impl Write) -> std::io::Result<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                ChunkState::Free => writeln!(out, "{i} F 0 0 -")?,
                ChunkState::Reserved => writeln!(out, "{i} R 0 0 -")?,
                ChunkState::SmallHost { bin, occupied, bitset, .. } => {
                    let hex = bitset
                        .leaf_words()
                        .iter()
                        .map(|w| format!("{w:016x}"))
                        .collect::<Vec<_>>()
                        .join(",");
                    writeln!(out, "{i} S {bin} {occupied} {hex}")?;
                }
                ChunkState::LargeHead { bin, run_len } => writeln!(out, "{i} H {bin} {run_len} -")?,
                ChunkState::LargeContinuation => writeln!(out, "{i} C 0 0 -")?,
            }
        }
        Ok(())
    }

    /// Rebuilds a chunk directory from lines written by [`serialize`](Self::serialize).
    pub fn deserialize(text: &str) -> Result<Self> {
        let mut dir = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bad = || Error::InvalidArgument("malformed chunk_directory line");
            let mut parts = line.splitn(5, ' ');
            let chunk: usize = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let kind = parts.next().ok_or_else(bad)?;
            let bin: BinNumber = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let count: usize = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let bitmap = parts.next().ok_or_else(bad)?;

            dir.ensure_len(chunk + 1);
            match kind {
                "F" => {}
                "R" => {
                    dir.entries[chunk] = ChunkState::Reserved;
                }
                "S" => {
                    let object_size = size_class::size_of_bin(bin);
                    let num_slots = CHUNK_SIZE / object_size;
                    let leaf_words: Vec<u64> = if bitmap == "-" {
                        Vec::new()
                    } else {
                        bitmap
                            .split(',')
                            .map(|h| u64::from_str_radix(h, 16).map_err(|_| bad()))
                            .collect::<Result<Vec<_>>>()?
                    };
                    let bitset = MultilayerBitset::from_leaf_words(num_slots, &leaf_words);
                    dir.entries[chunk] = ChunkState::SmallHost {
                        bin,
                        num_slots,
                        occupied: count,
                        bitset,
                    };
                }
                "H" => {
                    dir.entries[chunk] = ChunkState::LargeHead { bin, run_len: count };
                }
                "C" => {
                    dir.entries[chunk] = ChunkState::LargeContinuation;
                }
                _ => return Err(bad()),
            }
        }
        Ok(dir)
    }
}

impl Default for ChunkDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_host_tracks_occupancy_and_transitions() {
        let mut dir = ChunkDirectory::new();
        dir.ensure_len(1);
        dir.mark_small_host(0, 0); // bin 0 -> 8-byte objects
        let num_slots = dir.num_slots(0);
        assert!(num_slots > 1);

        let SlotAllocResult::Allocated(s0) = dir.allocate_slot(0) else {
            panic!("expected allocation")
        };
        assert_eq!(s0, 0);
        assert_eq!(dir.occupied(0), 1);

        let transition = dir.free_slot(0, s0);
        assert_eq!(transition, SlotFreedTransition::BecameEmpty);
        dir.mark_free(0);
        assert!(dir.is_free(0));
    }

    #[test]
    fn full_to_partial_transition_is_reported() {
        let mut dir = ChunkDirectory::new();
        dir.ensure_len(1);
        dir.mark_small_host(0, size_class::num_small_bins() as BinNumber - 1);
        let num_slots = dir.num_slots(0);

        let mut slots = Vec::new();
        for _ in 0..num_slots {
            let SlotAllocResult::Allocated(s) = dir.allocate_slot(0) else {
                panic!("expected room")
            };
            slots.push(s);
        }
        assert_eq!(dir.allocate_slot(0), SlotAllocResult::Full);

        let transition = dir.free_slot(0, slots[0]);
        assert_eq!(transition, SlotFreedTransition::BecameNonFull);
    }

    #[test]
    fn find_free_large_run_is_lowest_index_first_fit() {
        let mut dir = ChunkDirectory::new();
        dir.ensure_len(6);
        dir.mark_large_run(0, 1, 30);
        dir.mark_large_run(1, 1, 30);
        // chunk 2 is free
        dir.mark_large_run(3, 1, 30);
        // chunks 4,5 free

        assert_eq!(dir.find_free_large_run(1), Some(2));
        assert_eq!(dir.find_free_large_run(2), Some(4));
        assert_eq!(dir.find_free_large_run(3), None);

        dir.mark_free_run(1);
        assert_eq!(dir.find_free_large_run(1), Some(1));
    }

    #[test]
    fn all_free_reflects_directory_state() {
        let mut dir = ChunkDirectory::new();
        dir.ensure_len(2);
        assert!(dir.all_free());
        dir.mark_large_run(0, 2, 30);
        assert!(!dir.all_free());
        dir.mark_free_run(0);
        assert!(dir.all_free());
    }
}
