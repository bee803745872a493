//! # Configuration Constants
//!
//! All numeric configuration for the index engine, grouped by functional
//! area. When changing a constant, check the dependency notes on its
//! neighbors first.
//!
//! ## Dependency Graph
//!
//! ```text
//! MAX_ENTRIES_PER_NODE (255)
//!       │
//!       ├─> BUILD_FILL_FACTOR / REBUILD_FILL_FACTOR
//!       │     Effective leaf population = fill_factor% of max entries.
//!       │     A freshly built tree keeps (100 - fill_factor)% headroom for
//!       │     in-place inserts before any leaf has to relocate.
//!       │
//!       └─> The on-disk entry count is a single byte, so 255 is a format
//!           ceiling, not a tunable. The builder takes entries-per-node as a
//!           parameter and merely defaults to this value.
//!
//! LEAF_FREE_SPACE_PCT (10)
//!       │
//!       └─> Reserved tail inside every written leaf. Small edits grow into
//!           this slack instead of relocating the leaf through the
//!           free-space tracker.
//!
//! BATCH_MAX_VALUES (100_000)
//!       │
//!       └─> Stage B of the build pipeline holds at most this many values
//!           in its in-memory batch map before spilling a sorted run file.
//!           Equal keys merge into the current batch past the cap, so the
//!           real ceiling is BATCH_MAX_VALUES + (largest duplicate group).
//!
//! READER_CHUNK_SIZE (512 KiB)
//!       │
//!       └─> One sequential read per chunk; the merge stage opens one
//!           reader per run file, so peak buffer memory during a merge is
//!           runs × READER_CHUNK_SIZE.
//! ```

// ============================================================================
// TREE GEOMETRY
// ============================================================================

/// Format ceiling for entries per node: the on-disk entry count is one byte.
pub const MAX_ENTRIES_PER_NODE: u8 = 255;

/// Leaf population target when building a tree in memory from scratch.
pub const BUILD_FILL_FACTOR: u8 = 95;

/// Leaf population target when rebuilding an existing tree. Rebuilds happen
/// because in-place growth failed, so the new tree keeps generous headroom.
pub const REBUILD_FILL_FACTOR: u8 = 50;

/// Percentage of each leaf's payload reserved as in-place growth slack.
pub const LEAF_FREE_SPACE_PCT: u8 = 10;

/// Values blocks larger than this move to an ext-data block after the leaf
/// entry region; the entry keeps only a 4-byte offset.
pub const EXT_DATA_THRESHOLD: usize = 512;

/// Growth slack appended to every ext-data block, as a percentage of its
/// initial payload.
pub const EXT_DATA_FREE_PCT: u8 = 25;

/// Reserved free tail appended after the last node on every build, so the
/// first few post-build mutations can claim extents without growing the file.
pub const TREE_RESERVED_FREE: u32 = 64 * 1024;

// ============================================================================
// FILE FORMAT ALIGNMENT
// ============================================================================

/// The tree region starts at the next multiple of this after the envelope
/// header.
pub const TREE_BLOCK_ALIGN: u32 = 4096;

/// String keys are truncated to this many bytes before encoding.
pub const MAX_KEY_STRING_BYTES: usize = 255;

/// Encoded record pointers carry a 1-byte length, so this is a format
/// ceiling.
pub const MAX_RECORD_POINTER_BYTES: usize = 255;

// ============================================================================
// BUILD PIPELINE
// ============================================================================

/// Stage B in-memory batch cap (values, not keys).
pub const BATCH_MAX_VALUES: usize = 100_000;

/// Base of the per-level fanout cap during stage A enumeration. With `w`
/// wildcards in the index path the cap per level is
/// `round(ENUM_FANOUT_BASE ^ (0.5 ^ w))`: 500 children for a literal path,
/// ~22 per level with one wildcard, ~5 with two.
pub const ENUM_FANOUT_BASE: f64 = 500.0;

// ============================================================================
// I/O
// ============================================================================

/// Chunk size of the buffered random-access reader.
pub const READER_CHUNK_SIZE: usize = 512 * 1024;

// ============================================================================
// QUERY CACHE
// ============================================================================

/// Per-entry time-to-live of the query cache.
pub const QUERY_CACHE_TTL_SECS: u64 = 60;

const _: () = assert!(BUILD_FILL_FACTOR as usize <= 100);
const _: () = assert!(REBUILD_FILL_FACTOR as usize <= 100);
const _: () = assert!(LEAF_FREE_SPACE_PCT as usize <= 100);
const _: () = assert!(MAX_KEY_STRING_BYTES <= u16::MAX as usize);
const _: () = assert!(MAX_RECORD_POINTER_BYTES <= u8::MAX as usize);
