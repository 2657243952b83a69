//! Soft-dirty page tracking, used by the optional incremental-snapshot
//! path (`Segment::dirty_pages` / `Segment::reset_dirty`, SPEC_FULL.md
//! §9). Grounded on `original_source/include/metall/utility/pagemap.hpp`
//! and `.../detail/utility/soft_dirty_page.hpp`: both read
//! `/proc/self/pagemap` directly rather than going through a crate,
//! since no pack dependency wraps this interface.
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{Error, Result};

const PAGEMAP_ENTRY_BYTES: u64 = 8;

/// Bit 55 of a `/proc/self/pagemap` entry marks a soft-dirty page (set
/// by the kernel whenever the page is written, cleared by writing `4`
/// to `/proc/self/clear_refs`).
const SOFT_DIRTY_BIT: u64 = 1 << 55;
/// Bit 63 marks a present (mapped) page.
const PRESENT_BIT: u64 = 1 << 63;
/// Bit 62 marks a swapped-out page.
const SWAPPED_BIT: u64 = 1 << 62;

fn read_pagemap_entry(pagemap: &File, vaddr: usize, page_size: usize) -> Result<u64> {
    let page_index = (vaddr / page_size) as u64;
    let mut buf = [0u8; PAGEMAP_ENTRY_BYTES as usize];
    pagemap
        .read_exact_at(&mut buf, page_index * PAGEMAP_ENTRY_BYTES)
        .map_err(|e| Error::io("/proc/self/pagemap", e))?;
    Ok(u64::from_le_bytes(buf))
}

/// Returns, for each page in `[base, base + size)`, whether the kernel
/// has marked it soft-dirty since the last `reset_soft_dirty`. The
/// result has one entry per page, in address order.
pub fn soft_dirty_pages(base: usize, size: usize, page_size: usize) -> Result<Vec<bool>> {
    let pagemap = OpenOptions::new()
        .read(true)
        .open("/proc/self/pagemap")
        .map_err(|e| Error::io("/proc/self/pagemap", e))?;

    let num_pages = (size + page_size - 1) / page_size;
    let mut out = Vec::with_capacity(num_pages);
    for i in 0..num_pages {
        let entry = read_pagemap_entry(&pagemap, base + i * page_size, page_size)?;
        out.push(entry & SOFT_DIRTY_BIT != 0);
    }
    Ok(out)
}

/// Returns whether the page containing `vaddr` is currently resident
/// (present and not swapped out).
pub fn is_page_present(vaddr: usize, page_size: usize) -> Result<bool> {
    let pagemap = OpenOptions::new()
        .read(true)
        .open("/proc/self/pagemap")
        .map_err(|e| Error::io("/proc/self/pagemap", e))?;
    let entry = read_pagemap_entry(&pagemap, vaddr, page_size)?;
    Ok(entry & PRESENT_BIT != 0 && entry & SWAPPED_BIT == 0)
}

/// Clears every page's soft-dirty bit process-wide by writing `4` to
/// `/proc/self/clear_refs`, starting a fresh tracking interval.
pub fn reset_soft_dirty() -> Result<()> {
    let path = Path::new("/proc/self/clear_refs");
    std::fs::write(path, b"4").map_err(|e| Error::io(path, e))
}

/// Returns the entry count in `/proc/self/pagemap`, mostly useful to
/// sanity-check the file is readable before relying on it elsewhere.
pub fn pagemap_len() -> Result<u64> {
    let mut pagemap = OpenOptions::new()
        .read(true)
        .open("/proc/self/pagemap")
        .map_err(|e| Error::io("/proc/self/pagemap", e))?;
    let len = pagemap
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::io("/proc/self/pagemap", e))?;
    Ok(len / PAGEMAP_ENTRY_BYTES)
}
