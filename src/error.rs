//! Error kinds surfaced at the kernel boundary (spec §7). No exception
//! ever escapes a public call: every fallible operation returns a
//! `Result<_, Error>`.
use std::path::PathBuf;

use thiserror::Error;

/// Every way a kernel operation can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// The segment could not be grown to satisfy an allocation request.
    #[error("out of memory: requested {requested} bytes, segment at {current}/{max}")]
    OutOfMemory {
        requested: usize,
        current: usize,
        max: usize,
    },

    /// A caller-supplied argument makes no sense (zero-size allocation,
    /// malformed path, unsupported alignment, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `construct`/attribute `insert` found an existing entry under that
    /// name.
    #[error("duplicate name: {0}")]
    Duplicate(String),

    /// `find`/`destroy`/`erase` found no entry under that name.
    #[error("not found: {0}")]
    NotFound(String),

    /// The datastore at `path` is missing its properly-closed mark, or
    /// its version/uuid do not match what this process expects.
    #[error("inconsistent datastore at {path}: {reason}")]
    Inconsistent { path: PathBuf, reason: String },

    /// `create` was called on a path that already holds a datastore.
    #[error("datastore already exists at {0}")]
    AlreadyExists(PathBuf),

    /// An underlying filesystem call failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required kernel feature (pagemap, hole-punch, file clone) is
    /// unavailable on this platform.
    #[error("unsupported on this platform: {0}")]
    UnsupportedPlatform(&'static str),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn inconsistent(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Inconsistent {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
