//! # Interior Nodes
//!
//! Interior nodes route descents. Each entry pairs a separator key with a
//! less-than child pointer; one extra greater-than pointer closes the node.
//! The routing invariant is strict: every key under an entry's child is
//! smaller than the entry's key, and the entry's key equals the smallest
//! key of the subtree immediately to its right.
//!
//! ```text
//! offset  field
//! ------  ------------------------------
//! 0       byte_length u32   whole extent
//! 4       flags u8          (no LEAF bit)
//! 5       entries_count u8
//! 6       entry × count { key bytes, lt_child u48 }
//! ...     gt_child u48
//! ...     free space
//! ```
//!
//! Separator insertion after a leaf split rewrites the node image the same
//! way leaves are rewritten; the free tail absorbs most insertions.

use eyre::{ensure, Result};

use super::{read_u48, write_u48, NODE_FLAG_LEAF, NODE_PRELUDE_BYTES, POINTER_BYTES};
use crate::config::LEAF_FREE_SPACE_PCT;
use crate::encoding::IndexKey;

#[derive(Debug, Clone, PartialEq)]
pub struct InteriorEntry {
    pub key: IndexKey,
    pub lt_child: u64,
}

#[derive(Debug, Clone)]
pub struct InteriorNode {
    pub offset: u64,
    pub extent: u32,
    pub entries: Vec<InteriorEntry>,
    pub gt_child: u64,
    /// Region offsets of each child pointer field, entries first, then the
    /// greater-than pointer. Used to patch a single pointer after a child
    /// relocates.
    ptr_fields: Vec<u64>,
}

impl InteriorNode {
    /// Slot index used for the greater-than child.
    pub fn gt_slot(&self) -> usize {
        self.entries.len()
    }

    /// Picks the child to descend into for `key`, returning the pointer and
    /// its slot.
    pub fn child_for(&self, key: &IndexKey) -> (u64, usize) {
        let slot = self.entries.partition_point(|e| e.key <= *key);
        if slot == self.entries.len() {
            (self.gt_child, self.gt_slot())
        } else {
            (self.entries[slot].lt_child, slot)
        }
    }

    pub fn child_at(&self, slot: usize) -> u64 {
        if slot == self.gt_slot() {
            self.gt_child
        } else {
            self.entries[slot].lt_child
        }
    }

    /// Region offset of the child pointer field for `slot`, for in-place
    /// patching.
    pub fn child_field(&self, slot: usize) -> u64 {
        self.ptr_fields[slot]
    }

    pub fn leftmost_child(&self) -> u64 {
        if self.entries.is_empty() {
            self.gt_child
        } else {
            self.entries[0].lt_child
        }
    }

    pub fn rightmost_child(&self) -> u64 {
        self.gt_child
    }
}

fn entries_byte_len(entries: &[InteriorEntry]) -> usize {
    entries
        .iter()
        .map(|e| e.key.encode().len() + POINTER_BYTES)
        .sum::<usize>()
}

pub fn interior_min_extent(entries: &[InteriorEntry]) -> u32 {
    (NODE_PRELUDE_BYTES + 1 + entries_byte_len(entries) + POINTER_BYTES) as u32
}

pub fn interior_planned_extent(entries: &[InteriorEntry]) -> u32 {
    let payload = entries_byte_len(entries);
    let slack = (payload * LEAF_FREE_SPACE_PCT as usize) / 100;
    (NODE_PRELUDE_BYTES + 1 + payload + slack + POINTER_BYTES) as u32
}

pub fn interior_image(
    entries: &[InteriorEntry],
    gt_child: u64,
    extent: u32,
) -> Result<Vec<u8>> {
    ensure!(
        entries.len() <= u8::MAX as usize,
        "interior entry count {} exceeds format ceiling",
        entries.len()
    );
    let min = interior_min_extent(entries);
    ensure!(
        min <= extent,
        "interior node does not fit extent: need {} have {}",
        min,
        extent
    );

    let mut buf = Vec::with_capacity(extent as usize);
    buf.extend_from_slice(&extent.to_be_bytes());
    buf.push(0); // interior: no flags set
    buf.push(entries.len() as u8);
    for entry in entries {
        entry.key.encode_to(&mut buf);
        write_u48(&mut buf, entry.lt_child);
    }
    write_u48(&mut buf, gt_child);
    buf.resize(extent as usize, 0);
    Ok(buf)
}

pub fn parse_interior(bytes: &[u8], offset: u64) -> Result<InteriorNode> {
    ensure!(
        bytes.len() >= NODE_PRELUDE_BYTES + 1 + POINTER_BYTES,
        "interior extent too small"
    );
    let extent = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    ensure!(
        extent as usize == bytes.len(),
        "interior extent length mismatch: header {} buffer {}",
        extent,
        bytes.len()
    );
    ensure!(bytes[4] & NODE_FLAG_LEAF == 0, "expected interior node");

    let count = bytes[5] as usize;
    let mut at = 6;
    let mut entries = Vec::with_capacity(count);
    let mut ptr_fields = Vec::with_capacity(count + 1);
    for _ in 0..count {
        let (key, used) = IndexKey::decode(&bytes[at..])?;
        at += used;
        ensure!(bytes.len() >= at + POINTER_BYTES, "truncated child pointer");
        let lt_child = read_u48(&bytes[at..]);
        ptr_fields.push(offset + at as u64);
        at += POINTER_BYTES;
        entries.push(InteriorEntry { key, lt_child });
    }
    ensure!(bytes.len() >= at + POINTER_BYTES, "truncated gt pointer");
    let gt_child = read_u48(&bytes[at..]);
    ptr_fields.push(offset + at as u64);

    Ok(InteriorNode {
        offset,
        extent,
        entries,
        gt_child,
        ptr_fields,
    })
}
