//! Metall: a persistent heap allocator. An open [`Manager`] owns one
//! memory-mapped datastore on disk; objects allocated through it are
//! addressed as byte offsets from the segment base, so the same
//! datastore can be closed, reopened (possibly by a different
//! process), and the graph of objects inside it is still valid.
//!
//! See `manager` for the kernel that ties segment storage, the chunk
//! and bin directories, the per-thread object cache, and the named /
//! unique / anonymous attribute directories together into the
//! `create`/`open`/`allocate`/`construct`/`close` API.

pub mod attribute;
pub mod bin_directory;
pub mod bitset;
mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod logger;
pub mod manager;
pub mod offset_ptr;
pub mod platform;
pub mod segment;
pub mod size_class;

pub use error::{Error, Result};
pub use manager::Manager;
pub use offset_ptr::OffsetPtr;
