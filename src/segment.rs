//! Segment storage (spec §4.D): one contiguous virtual-address range,
//! grown on demand by mapping additional backing blocks into it.
//!
//! Grounded on the teacher's `mill.rs`, which carves guard-paged
//! sub-regions out of a large `PROT_NONE` reservation and commits them
//! one piece at a time (`Mill::reserve` / `allocate` / `commit`); a
//! `Segment` plays the same role but the "pieces" are whole
//! [`crate::config::BLOCK_SIZE`]-sized backing files mapped
//! `MAP_SHARED`, and growth only ever appends (no reuse of
//! already-committed ranges — that's what the chunk/bin directories
//! are for).
use std::ffi::c_void;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::config::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::platform::{file as pfile, mmap};

const BLOCK_DIR: &str = "segment";

pub(crate) fn block_file_name(block_no: usize) -> String {
    format!("block-{block_no:04}")
}

/// The bytes at the very start of the segment: enough for any
/// in-region pointer to find its way back to the kernel object that
/// owns the mapping it lives in (spec §9 "pointer graphs in
/// persistent memory"). `manager_kernel_address` is a live, in-process
/// pointer value — it is rewritten every time the segment is mapped
/// and carries no meaning across a re-open at a different base.
#[repr(C)]
struct SegmentHeader {
    manager_kernel_address: usize,
}

/// A single contiguous virtual-address range backed by a growable set
/// of on-disk blocks.
pub struct Segment {
    block_dir: PathBuf,
    base: NonNull<c_void>,
    max_size: usize,
    current_size: usize,
    blocks: Vec<File>,
}

// The segment owns its mapping and its backing files exclusively; it
// is moved between threads only behind the kernel's allocator mutex.
unsafe impl Send for Segment {}

impl Segment {
    /// Reserves `max_size` bytes of address space and maps the first
    /// backing block over the start of it. `root` is the datastore
    /// root directory; the `segment/` subdirectory is created here.
    pub fn create(root: &Path, max_size: usize) -> Result<Self> {
        assert!(max_size % BLOCK_SIZE == 0);
        let block_dir = root.join(BLOCK_DIR);
        std::fs::create_dir_all(&block_dir).map_err(|e| Error::io(&block_dir, e))?;

        let base = mmap::reserve_region(max_size)?;
        let mut segment = Segment {
            block_dir,
            base,
            max_size,
            current_size: 0,
            blocks: Vec::new(),
        };
        segment.append_block()?;
        Ok(segment)
    }

    /// Re-reserves the address range and re-maps every block that was
    /// present at last close, in order, reconstructing `current_size`
    /// from how many block files exist.
    pub fn open(root: &Path, max_size: usize, num_blocks: usize) -> Result<Self> {
        assert!(num_blocks > 0);
        let block_dir = root.join(BLOCK_DIR);
        let base = mmap::reserve_region(max_size)?;

        let mut segment = Segment {
            block_dir,
            base,
            max_size,
            current_size: 0,
            blocks: Vec::new(),
        };

        for block_no in 0..num_blocks {
            if let Err(e) = segment.map_existing_block(block_no) {
                // Roll back to the last consistent size (spec §4.D
                // failure semantics) before surfacing the error.
                let _ = mmap::release_region(segment.base, segment.max_size);
                return Err(e);
            }
        }
        Ok(segment)
    }

    fn map_existing_block(&mut self, block_no: usize) -> Result<()> {
        let path = self.block_dir.join(block_file_name(block_no));
        let file = pfile::open_rw(&path)?;
        let offset = block_no * BLOCK_SIZE;
        let region = unsafe { self.base_plus(offset) };
        mmap::map_fixed_shared(region, BLOCK_SIZE, &file, 0)?;
        self.blocks.push(file);
        self.current_size = (block_no + 1) * BLOCK_SIZE;
        Ok(())
    }

    fn append_block(&mut self) -> Result<()> {
        let block_no = self.blocks.len();
        let path = self.block_dir.join(block_file_name(block_no));
        let file = pfile::create_sized(&path, BLOCK_SIZE as u64)?;
        let offset = block_no * BLOCK_SIZE;
        let region = unsafe { self.base_plus(offset) };

        if let Err(e) = mmap::map_fixed_shared(region, BLOCK_SIZE, &file, 0) {
            let _ = pfile::remove(&path);
            return Err(e);
        }

        self.blocks.push(file);
        self.current_size += BLOCK_SIZE;
        Ok(())
    }

    unsafe fn base_plus(&self, offset: usize) -> NonNull<c_void> {
        NonNull::new_unchecked((self.base.as_ptr() as *mut u8).add(offset) as *mut c_void)
    }

    /// Ensures at least `needed_size` bytes are backed and mapped,
    /// appending whole blocks as necessary. Fails with
    /// [`Error::OutOfMemory`] if that would exceed `max_size`; growth
    /// is never automatic beyond the configured maximum (spec §4.D).
    pub fn grow_to(&mut self, needed_size: usize) -> Result<()> {
        while self.current_size < needed_size {
            if self.current_size + BLOCK_SIZE > self.max_size {
                return Err(Error::OutOfMemory {
                    requested: needed_size,
                    current: self.current_size,
                    max: self.max_size,
                });
            }
            self.append_block()?;
        }
        Ok(())
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr() as *mut u8
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Writes the owning kernel's address into the first page of the
    /// segment, so `kernel_address_from` can recover it later from any
    /// pointer inside this mapping.
    pub fn write_header(&mut self, manager_kernel_address: usize) {
        let header = self.base_ptr() as *mut SegmentHeader;
        unsafe {
            (*header).manager_kernel_address = manager_kernel_address;
        }
    }

    pub fn kernel_address(&self) -> usize {
        let header = self.base_ptr() as *const SegmentHeader;
        unsafe { (*header).manager_kernel_address }
    }

    /// Releases the backing storage for `[offset, offset + len)`:
    /// punches a hole in whichever block file(s) the range spans
    /// (only whole pages are released) and tells the kernel those
    /// pages can be dropped immediately.
    pub fn free_region(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let page = mmap::page_size();
        let aligned_start = (offset + page - 1) / page * page;
        let aligned_end = (offset + len) / page * page;
        if aligned_end <= aligned_start {
            return Ok(());
        }

        let mut pos = aligned_start;
        while pos < aligned_end {
            let block_no = pos / BLOCK_SIZE;
            let block_start = block_no * BLOCK_SIZE;
            let within_block_end = (aligned_end).min(block_start + BLOCK_SIZE);
            let within_offset = (pos - block_start) as u64;
            let within_len = (within_block_end - pos) as u64;

            pfile::punch_hole(
                &self.blocks[block_no],
                &self.block_dir.join(block_file_name(block_no)),
                within_offset,
                within_len,
            )?;

            let region = unsafe { self.base_plus(pos) };
            mmap::advise_dont_need(region, within_len as usize)?;

            pos = within_block_end;
        }
        Ok(())
    }

    /// msync's the live mapping, then fsync's every backing file.
    pub fn sync(&self) -> Result<()> {
        mmap::msync(self.base, self.current_size)?;
        for (block_no, file) in self.blocks.iter().enumerate() {
            pfile::fsync(file, &self.block_dir.join(block_file_name(block_no)))?;
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let _ = mmap::release_region(self.base, self.max_size);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_maps_one_block_and_is_writable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut segment = Segment::create(dir.path(), 64 * BLOCK_SIZE).expect("create");
        assert_eq!(segment.num_blocks(), 1);
        assert_eq!(segment.current_size(), BLOCK_SIZE);

        unsafe {
            *(segment.base_ptr().add(BLOCK_SIZE - 1)) = 0x7Fu8;
        }

        segment.write_header(0xDEAD_BEEF);
        assert_eq!(segment.kernel_address(), 0xDEAD_BEEF);
    }

    #[test]
    fn grow_to_appends_blocks_and_respects_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut segment = Segment::create(dir.path(), 3 * BLOCK_SIZE).expect("create");

        segment.grow_to(3 * BLOCK_SIZE).expect("grow within max");
        assert_eq!(segment.num_blocks(), 3);

        let err = segment.grow_to(4 * BLOCK_SIZE).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
    }

    #[test]
    fn open_reconstructs_mapping_from_existing_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut segment = Segment::create(dir.path(), 8 * BLOCK_SIZE).expect("create");
            segment.grow_to(2 * BLOCK_SIZE).expect("grow");
            unsafe {
                *(segment.base_ptr()) = 0x99;
            }
            segment.sync().expect("sync");
        }

        let segment = Segment::open(dir.path(), 8 * BLOCK_SIZE, 2).expect("open");
        assert_eq!(segment.num_blocks(), 2);
        unsafe {
            assert_eq!(*segment.base_ptr(), 0x99);
        }
    }
}
