//! Platform I/O (spec §4.A): mmap/munmap, file extend, sparse copy,
//! pagemap, fsync, file clone. Everything that talks to the kernel
//! lives here; the rest of the crate only deals in offsets and typed
//! errors.
pub mod file;
pub mod mmap;
pub mod pagemap;

pub use mmap::page_size;
