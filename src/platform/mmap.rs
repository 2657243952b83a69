//! Address-space reservation and file-backed mapping.
//!
//! This mirrors the three-operation shape the teacher crate's `map.rs`
//! exposes (`reserve_region` / `release_region` / `allocate_region`),
//! but talks to `libc` directly instead of out to a bundled C support
//! library: a `Mill`'s job in the teacher is to get address space from
//! the OS and hand out chunks of it, and that's exactly what a
//! `Segment` needs to reserve its virtual range up front and then map
//! backing blocks into pieces of it with `MAP_FIXED`.
use std::ffi::c_void;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use lazy_static::lazy_static;

use crate::error::{Error, Result};

lazy_static! {
    static ref PAGE_SIZE: usize = {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 {
            4096
        } else {
            ret as usize
        }
    };
}

/// Returns the system page size. Constant for the life of the process.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Reserves `size` bytes of address space with no access rights
/// (`PROT_NONE`). The returned address is page-aligned; `size` must
/// already be page-aligned.
///
/// This does not commit any physical memory: it only carves out a
/// range that later `map_fixed` calls can safely replace.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>> {
    assert!(size > 0 && size % page_size() == 0);

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(Error::io(
            "<anonymous mmap>",
            std::io::Error::from_raw_os_error(last_errno()),
        ));
    }

    Ok(NonNull::new(addr).expect("mmap never returns null on success"))
}

/// Releases a region previously obtained from `reserve_region` (or a
/// sub-range of one, as long as it starts and ends on a page
/// boundary).
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    assert_eq!(size % page_size(), 0);

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };
    if ret != 0 {
        return Err(Error::io(
            "<munmap>",
            std::io::Error::from_raw_os_error(last_errno()),
        ));
    }
    Ok(())
}

/// Maps `size` bytes of `file` (starting at `file_offset`) at the fixed
/// address `base`, replacing whatever reservation previously lived
/// there. Used to grow the segment: `base` always lies inside a range
/// earlier returned by `reserve_region`.
pub fn map_fixed_shared(
    base: NonNull<c_void>,
    size: usize,
    file: &File,
    file_offset: u64,
) -> Result<()> {
    assert_eq!(base.as_ptr() as usize % page_size(), 0);
    assert_eq!(size % page_size(), 0);

    let addr = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            file_offset as libc::off_t,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(Error::io(
            "<file-backed mmap>",
            std::io::Error::from_raw_os_error(last_errno()),
        ));
    }
    debug_assert_eq!(addr, base.as_ptr());
    Ok(())
}

/// Temporarily maps `file` read-only, purely to inspect its contents
/// without disturbing the live segment. Used while `open`-ing a
/// datastore before the segment itself has been reconstructed.
pub fn map_read_only(file: &File, size: usize) -> Result<NonNull<c_void>> {
    assert!(size > 0);
    let rounded = round_up(size, page_size());

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            rounded,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(Error::io(
            "<read-only mmap>",
            std::io::Error::from_raw_os_error(last_errno()),
        ));
    }
    Ok(NonNull::new(addr).expect("mmap never returns null on success"))
}

/// msync's `[base, base+size)` with `MS_SYNC`, flushing dirty pages to
/// their backing files before returning.
pub fn msync(base: NonNull<c_void>, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let ret = unsafe { libc::msync(base.as_ptr(), size, libc::MS_SYNC) };
    if ret != 0 {
        return Err(Error::io(
            "<msync>",
            std::io::Error::from_raw_os_error(last_errno()),
        ));
    }
    Ok(())
}

/// Hints to the kernel that `[base, base+size)` will not be needed
/// again soon, letting it drop clean pages immediately. Used after
/// punching a hole in the backing file for a freed large-object run.
pub fn advise_dont_need(base: NonNull<c_void>, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let ret = unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) };
    if ret != 0 {
        return Err(Error::io(
            "<madvise>",
            std::io::Error::from_raw_os_error(last_errno()),
        ));
    }
    Ok(())
}
