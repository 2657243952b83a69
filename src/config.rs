//! Compile-time tunables. The original metall parameterises its kernel
//! template on these as non-type template arguments; we keep them as
//! plain constants (spec §4.C, §9 "leaves batch-size tuning to the
//! implementer").
#[cfg(not(feature = "test_only_small_constants"))]
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024; // 2 MiB, must be a power of 2.

#[cfg(feature = "test_only_small_constants")]
pub const CHUNK_SIZE: usize = 64 * 1024; // Shrunk so tests can exercise many chunks cheaply.

/// Size of one backing file that gets mapped into the segment.
#[cfg(not(feature = "test_only_small_constants"))]
pub const BLOCK_SIZE: usize = 256 * 1024 * 1024; // 256 MiB.

#[cfg(feature = "test_only_small_constants")]
pub const BLOCK_SIZE: usize = 4 * CHUNK_SIZE;

/// Default maximum size of a segment's virtual address reservation.
#[cfg(not(feature = "test_only_small_constants"))]
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 1usize << 43; // 8 TiB.

#[cfg(feature = "test_only_small_constants")]
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 64 * BLOCK_SIZE;

/// Byte budget per bin for the thread-local object cache (spec §4.G).
/// Capacity per bin is `CACHE_BYTES_PER_BIN / size_of(bin)`.
pub const CACHE_BYTES_PER_BIN: usize = 8 * 1024;

/// Largest object size handled through the bin/chunk path rather than
/// as a raw multi-chunk allocation. Doubling from `CHUNK_SIZE` defines
/// the large-object bins (spec §4.C).
#[cfg(not(feature = "test_only_small_constants"))]
pub const MAX_OBJECT_SIZE: usize = 1usize << 31; // 2 GiB.

#[cfg(feature = "test_only_small_constants")]
pub const MAX_OBJECT_SIZE: usize = 32 * CHUNK_SIZE;

/// On-disk format version. Bumped whenever the metadata text schema or
/// the segment layout changes incompatibly.
pub const FORMAT_VERSION: i32 = 1;

static_assertions::const_assert!(CHUNK_SIZE.is_power_of_two());
static_assertions::const_assert!(BLOCK_SIZE % CHUNK_SIZE == 0);
static_assertions::const_assert!(DEFAULT_MAX_SEGMENT_SIZE % BLOCK_SIZE == 0);
