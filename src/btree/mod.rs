//! # Binary B+Tree
//!
//! This module implements the persistent B+tree that backs every index
//! file. All entries live in leaves, leaves are doubly linked in key order,
//! and interior nodes route descents with separator keys.
//!
//! ## Tree Region Layout
//!
//! The tree occupies a region of the index file starting right after the
//! envelope header. All pointers inside the region are byte offsets
//! *relative to the region start*, so the region can be relocated (and is,
//! on every rebuild) without rewriting a single node.
//!
//! ```text
//! +--------------------------+  region offset 0
//! | tree header              |  byte_length, flags, geometry, root_ptr,
//! |                          |  metadata key names
//! +--------------------------+
//! | interior nodes           |  root first, then level by level
//! +--------------------------+
//! | leaves, in key order     |  doubly linked chain
//! +--------------------------+
//! | reserved free tail       |  claimed by the free-space tracker
//! +--------------------------+
//! ```
//!
//! ## Node Record Layout
//!
//! Every node starts with a 5-byte prelude and owns its whole extent,
//! including growth slack and (for leaves) the ext-data region:
//!
//! ```text
//! node     : byte_length u32, flags u8, payload, free space
//! interior : entries_count u8,
//!            entry × count { key, lt_child u48 }, gt_child u48
//! leaf     : free_byte_length u32, prev_leaf u48, next_leaf u48,
//!            [ext_byte_length u32, ext_free_length u32]  when HAS_EXT,
//!            entries_count u8, entry × count, free space, [ext region]
//! ```
//!
//! The entry count is one byte (format ceiling of 255 entries per node)
//! and node pointers are 48 bits. Those widths are fixed here, in the
//! format layer; the in-memory builder takes geometry as parameters.
//!
//! ## Mutation Strategy
//!
//! Nodes are never edited field-by-field. A mutation parses the target
//! leaf, applies the change in memory and rewrites the extent:
//!
//! 1. in place, when the new image fits the allocated extent;
//! 2. into a larger extent claimed from the [`FreeSpaceTracker`],
//!    patching the parent child pointer and both sibling links;
//! 3. as a median split when the leaf is at the entry-count ceiling,
//!    pushing a separator into the parent (which may itself relocate,
//!    split, and ultimately grow a new root);
//! 4. failing all of that, the operation fails with `TreeFull` and the
//!    index layer rebuilds the whole tree through the bulk builder.
//!
//! Underfull leaves are never merged and emptied leaves stay in the chain
//! as tombstones; parent routing keeps pointing at them, so descents stay
//! valid and rebuilds reclaim the space.
//!
//! ## Module Organization
//!
//! - [`header`]: the tree header at region offset 0
//! - [`freespace`]: in-memory extent tracker over the region's free space
//! - [`leaf`]: leaf parsing, serialization and size planning
//! - [`interior`]: interior node parsing and serialization
//! - [`tree`]: the tree itself: search, mutate, transactions, rebuild
//! - [`builder`]: two-pass bulk construction from an ordered entry stream

pub mod builder;
pub mod freespace;
pub mod header;
pub mod interior;
pub mod leaf;
pub mod tree;

pub use builder::{build_tree, BuildStats, EntrySource, TreeBuilderOptions, VecEntrySource};
pub use freespace::FreeSpaceTracker;
pub use header::TreeState;
pub use leaf::{EntryValue, LeafEntry};
pub use tree::{
    BinaryBTree, FailedTransaction, SearchOptions, TreeEntry, TreeOp, TreeQuery, TreeSearchResult,
};

/// Width of node pointers inside the tree region.
pub const POINTER_BYTES: usize = 6;

/// Node prelude: byte_length u32 + flags u8.
pub const NODE_PRELUDE_BYTES: usize = 5;

pub const NODE_FLAG_LEAF: u8 = 0b0000_0001;
pub const NODE_FLAG_HAS_EXT: u8 = 0b0000_0010;

/// Largest offset a 48-bit pointer can address.
pub const MAX_POINTER: u64 = (1 << 48) - 1;

pub(crate) fn write_u48(buf: &mut Vec<u8>, value: u64) {
    debug_assert!(value <= MAX_POINTER);
    buf.extend_from_slice(&value.to_be_bytes()[2..]);
}

pub(crate) fn read_u48(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw[2..].copy_from_slice(&buf[..POINTER_BYTES]);
    u64::from_be_bytes(raw)
}
