//! Bin directory (spec §4.F): for each small-object bin, a deque of
//! chunk numbers known to have at least one free slot.
//!
//! Ported from `v0/kernel/bin_directory.hpp`'s
//! `array<deque<chunk_no_type>, k_num_bins>` plus its
//! insert(emplace_front)/pop(pop_front)/erase(linear scan) operation
//! set and `"bin_no chunk_no"` text serialization.
use std::collections::VecDeque;
use std::io::Write;

use crate::size_class::{self, BinNumber};

pub struct BinDirectory {
    bins: Vec<VecDeque<usize>>,
}

impl BinDirectory {
    pub fn new() -> Self {
        Self {
            bins: (0..size_class::num_small_bins()).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Returns the most recently inserted chunk known to have a free
    /// slot in `bin`, without removing it.
    pub fn front(&self, bin: BinNumber) -> Option<usize> {
        self.bins[bin as usize].front().copied()
    }

    /// Prepends `chunk` to `bin`'s list (most-recently-used first).
    pub fn insert(&mut self, bin: BinNumber, chunk: usize) {
        debug_assert!(!self.bins[bin as usize].contains(&chunk));
        self.bins[bin as usize].push_front(chunk);
    }

    /// Removes and returns the front of `bin`'s list.
    pub fn pop(&mut self, bin: BinNumber) -> Option<usize> {
        self.bins[bin as usize].pop_front()
    }

    /// Removes a specific chunk from `bin`'s list, wherever it sits.
    /// O(n) in the bin's size; acceptable because a chunk is erased
    /// only on a state transition (spec §4.F).
    pub fn erase(&mut self, bin: BinNumber, chunk: usize) -> bool {
        let deque = &mut self.bins[bin as usize];
        if let Some(pos) = deque.iter().position(|&c| c == chunk) {
            deque.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self, bin: BinNumber) -> bool {
        self.bins[bin as usize].is_empty()
    }

    /// Iterates every `(bin_no, chunk_no)` pair, in bin order then
    /// front-to-back within a bin — the order the text serializer
    /// writes them in.
    pub fn iter(&self) -> impl Iterator<Item = (BinNumber, usize)> + '_ {
        self.bins.iter().enumerate().flat_map(|(bin, deque)| {
            deque.iter().map(move |&chunk| (bin as BinNumber, chunk))
        })
    }

    /// Writes `"<bin_no> <chunk_no>"` lines, one per tracked chunk.
    pub fn serialize(&self, out: &mut impl Write) -> std::io::Result<()> {
        for (bin, chunk) in self.iter() {
            writeln!(out, "{bin} {chunk}")?;
        }
        Ok(())
    }

    /// Rebuilds the directory from lines written by `serialize`.
    pub fn deserialize(text: &str) -> crate::error::Result<Self> {
        let mut directory = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let bin: BinNumber = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::Error::InvalidArgument("malformed bin_directory line"))?;
            let chunk: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::Error::InvalidArgument("malformed bin_directory line"))?;
            // Preserve on-disk order: lines were written front-to-back,
            // so appending with push_back reproduces the same deque.
            directory.bins[bin as usize].push_back(chunk);
        }
        Ok(directory)
    }
}

impl Default for BinDirectory {
    fn default() -> Self {
        Self::new()
    }
}
