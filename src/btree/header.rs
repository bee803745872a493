//! # Tree Header
//!
//! The first bytes of the tree region describe the tree itself: geometry,
//! flags, the root pointer and the metadata key names every value carries.
//! The fixed prelude is a zerocopy struct over big-endian fields; the
//! variable tail lists the metadata keys.
//!
//! ```text
//! offset  field
//! ------  --------------------------------------------
//! 0       byte_length u32    used region bytes (header + nodes)
//! 4       flags u8           UNIQUE | HAS_METADATA
//! 5       entries_per_node u8
//! 6       depth u8
//! 7       fill_factor u8
//! 8       free_bytes u32     reserved tail after byte_length
//! 12      root_ptr u48
//! 18      metadata_keys      count u8, (len u8 + bytes) × count
//! ```
//!
//! `byte_length`, `free_bytes`, `root_ptr` and `depth` mutate in place as
//! the tree grows; their field offsets are exported for patching.

use eyre::{ensure, Result};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::zerocopy_accessors;

pub const TREE_FLAG_UNIQUE: u8 = 0b0000_0001;
pub const TREE_FLAG_METADATA: u8 = 0b0000_0010;

pub const TREE_PRELUDE_SIZE: usize = 18;

/// Field offsets within the region, for in-place patches.
pub const FIELD_BYTE_LENGTH: u64 = 0;
pub const FIELD_DEPTH: u64 = 6;
pub const FIELD_FREE_BYTES: u64 = 8;
pub const FIELD_ROOT_PTR: u64 = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TreePrelude {
    byte_length: U32,
    flags: u8,
    entries_per_node: u8,
    depth: u8,
    fill_factor: u8,
    free_bytes: U32,
    root_ptr: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<TreePrelude>() == TREE_PRELUDE_SIZE);

impl TreePrelude {
    zerocopy_accessors! {
        byte_length: u32,
        free_bytes: u32,
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn entries_per_node(&self) -> u8 {
        self.entries_per_node
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn fill_factor(&self) -> u8 {
        self.fill_factor
    }

    pub fn root_ptr(&self) -> u64 {
        super::read_u48(&self.root_ptr)
    }
}

/// Decoded tree header plus derived lengths.
#[derive(Debug, Clone)]
pub struct TreeState {
    pub byte_length: u32,
    pub free_bytes: u32,
    pub root_ptr: u64,
    pub depth: u8,
    pub unique: bool,
    pub entries_per_node: u8,
    pub fill_factor: u8,
    pub metadata_keys: Vec<String>,
    pub header_len: u32,
}

impl TreeState {
    pub fn metadata_len(&self) -> usize {
        self.metadata_keys.len()
    }
}

pub fn encode_tree_header(state: &TreeState) -> Result<Vec<u8>> {
    let mut flags = 0u8;
    if state.unique {
        flags |= TREE_FLAG_UNIQUE;
    }
    if !state.metadata_keys.is_empty() {
        flags |= TREE_FLAG_METADATA;
    }
    let mut root = [0u8; 6];
    root.copy_from_slice(&state.root_ptr.to_be_bytes()[2..]);

    let prelude = TreePrelude {
        byte_length: U32::new(state.byte_length),
        flags,
        entries_per_node: state.entries_per_node,
        depth: state.depth,
        fill_factor: state.fill_factor,
        free_bytes: U32::new(state.free_bytes),
        root_ptr: root,
    };

    let mut buf = Vec::with_capacity(state.header_len as usize);
    buf.extend_from_slice(prelude.as_bytes());
    ensure!(
        state.metadata_keys.len() <= u8::MAX as usize,
        "too many metadata keys: {}",
        state.metadata_keys.len()
    );
    buf.push(state.metadata_keys.len() as u8);
    for key in &state.metadata_keys {
        ensure!(
            key.len() <= u8::MAX as usize,
            "metadata key too long: {:?}",
            key
        );
        buf.push(key.len() as u8);
        buf.extend_from_slice(key.as_bytes());
    }
    Ok(buf)
}

pub fn tree_header_len(metadata_keys: &[String]) -> u32 {
    let keys: usize = metadata_keys.iter().map(|k| 1 + k.len()).sum();
    (TREE_PRELUDE_SIZE + 1 + keys) as u32
}

pub fn decode_tree_header(bytes: &[u8]) -> Result<TreeState> {
    ensure!(
        bytes.len() > TREE_PRELUDE_SIZE,
        "tree header too short: {} bytes",
        bytes.len()
    );
    let prelude = TreePrelude::ref_from_bytes(&bytes[..TREE_PRELUDE_SIZE])
        .map_err(|e| eyre::eyre!("failed to parse tree prelude: {:?}", e))?;

    let count = bytes[TREE_PRELUDE_SIZE] as usize;
    let mut at = TREE_PRELUDE_SIZE + 1;
    let mut metadata_keys = Vec::with_capacity(count);
    for _ in 0..count {
        ensure!(at < bytes.len(), "truncated metadata key length");
        let len = bytes[at] as usize;
        at += 1;
        ensure!(at + len <= bytes.len(), "truncated metadata key");
        metadata_keys.push(std::str::from_utf8(&bytes[at..at + len])?.to_string());
        at += len;
    }

    Ok(TreeState {
        byte_length: prelude.byte_length(),
        free_bytes: prelude.free_bytes(),
        root_ptr: prelude.root_ptr(),
        depth: prelude.depth(),
        unique: prelude.flags() & TREE_FLAG_UNIQUE != 0,
        entries_per_node: prelude.entries_per_node(),
        fill_factor: prelude.fill_factor(),
        metadata_keys,
        header_len: at as u32,
    })
}
