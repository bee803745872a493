//! # Leaf Nodes
//!
//! A leaf stores its entries sorted ascending by key, a doubly-linked
//! chain to its neighbors, and an explicit free-space tail for in-place
//! growth. Entries whose value lists outgrow the inline threshold move to
//! an ext-data region at the end of the leaf's extent; the entry then
//! carries a 4-byte offset into that region instead of inline bytes.
//!
//! ## Extent Layout
//!
//! ```text
//! offset  field
//! ------  -----------------------------------------
//! 0       byte_length u32     whole extent, ext region included
//! 4       flags u8            LEAF | HAS_EXT
//! 5       free_byte_length u32
//! 9       prev_leaf u48
//! 15      next_leaf u48
//! 21      ext_byte_length u32, ext_free_length u32   (HAS_EXT only)
//! ...     entries_count u8
//! ...     entry × count
//! ...     free space            (free_byte_length bytes)
//! ...     ext region            (ext_byte_length bytes, HAS_EXT only)
//! ```
//!
//! ```text
//! entry : key bytes,
//!         val_length u32        bit 31 set = values in ext region
//!         inline → values block | ext → ext_ptr u32
//! values block (non-unique) : values_count u32, value × count
//! value : rp_length u8, record-pointer bytes,
//!         metadata value × metadata_keys.len
//! ```
//!
//! Mutations never edit entries surgically; the tree parses the leaf,
//! changes it in memory and re-serializes the whole extent image. The
//! explicit free tail makes the common case an in-place rewrite.

use eyre::{bail, ensure, Result};

use super::{read_u48, write_u48, NODE_FLAG_HAS_EXT, NODE_FLAG_LEAF, NODE_PRELUDE_BYTES};
use crate::config::{EXT_DATA_FREE_PCT, EXT_DATA_THRESHOLD, LEAF_FREE_SPACE_PCT};
use crate::encoding::IndexKey;

/// Region-relative offset of the prev pointer within a leaf extent.
pub const LEAF_PREV_FIELD: u64 = 9;
/// Region-relative offset of the next pointer within a leaf extent.
pub const LEAF_NEXT_FIELD: u64 = 15;

const EXT_FLAG_BIT: u32 = 1 << 31;

/// One indexed record: its pointer plus the co-stored metadata tuple,
/// aligned with the tree's metadata key names.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryValue {
    pub record_pointer: Vec<u8>,
    pub metadata: Vec<IndexKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub key: IndexKey,
    pub values: Vec<EntryValue>,
}

#[derive(Debug, Clone)]
pub struct Leaf {
    pub offset: u64,
    pub extent: u32,
    pub prev: u64,
    pub next: u64,
    pub entries: Vec<LeafEntry>,
}

impl Leaf {
    pub fn entry_index(&self, key: &IndexKey) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }
}

fn encode_value(value: &EntryValue, metadata_len: usize, buf: &mut Vec<u8>) -> Result<()> {
    ensure!(
        value.record_pointer.len() <= u8::MAX as usize,
        "record pointer too long: {} bytes",
        value.record_pointer.len()
    );
    ensure!(
        value.metadata.len() == metadata_len,
        "metadata arity mismatch: {} != {}",
        value.metadata.len(),
        metadata_len
    );
    buf.push(value.record_pointer.len() as u8);
    buf.extend_from_slice(&value.record_pointer);
    for meta in &value.metadata {
        meta.encode_to(buf);
    }
    Ok(())
}

/// Serializes an entry's values block (without the entry header).
pub fn encode_values_block(
    values: &[EntryValue],
    unique: bool,
    metadata_len: usize,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if unique {
        ensure!(values.len() == 1, "unique tree entry must hold one value");
        encode_value(&values[0], metadata_len, &mut buf)?;
    } else {
        buf.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for value in values {
            encode_value(value, metadata_len, &mut buf)?;
        }
    }
    Ok(buf)
}

fn decode_value(buf: &[u8], metadata_len: usize) -> Result<(EntryValue, usize)> {
    ensure!(!buf.is_empty(), "truncated value");
    let rp_len = buf[0] as usize;
    ensure!(buf.len() >= 1 + rp_len, "truncated record pointer");
    let record_pointer = buf[1..1 + rp_len].to_vec();
    let mut at = 1 + rp_len;
    let mut metadata = Vec::with_capacity(metadata_len);
    for _ in 0..metadata_len {
        let (key, used) = IndexKey::decode(&buf[at..])?;
        metadata.push(key);
        at += used;
    }
    Ok((
        EntryValue {
            record_pointer,
            metadata,
        },
        at,
    ))
}

/// Encodes one value the way leaves store it (pointer, then metadata).
/// The build pipeline uses the same bytes in its scratch files so the
/// final merge feeds the tree builder without translation.
pub fn encode_value_bytes(value: &EntryValue, metadata_len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value(value, metadata_len, &mut buf)?;
    Ok(buf)
}

pub fn decode_value_bytes(buf: &[u8], metadata_len: usize) -> Result<(EntryValue, usize)> {
    decode_value(buf, metadata_len)
}

pub fn decode_values_block(
    buf: &[u8],
    unique: bool,
    metadata_len: usize,
) -> Result<Vec<EntryValue>> {
    if unique {
        let (value, _) = decode_value(buf, metadata_len)?;
        return Ok(vec![value]);
    }
    ensure!(buf.len() >= 4, "truncated values count");
    let count = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    let mut at = 4;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let (value, used) = decode_value(&buf[at..], metadata_len)?;
        values.push(value);
        at += used;
    }
    Ok(values)
}

struct EntryLayout {
    key_bytes: Vec<u8>,
    values_block: Vec<u8>,
    ext: bool,
}

fn layout_entries(
    entries: &[LeafEntry],
    unique: bool,
    metadata_len: usize,
) -> Result<(Vec<EntryLayout>, usize, usize)> {
    let mut layouts = Vec::with_capacity(entries.len());
    let mut entry_bytes = 0usize;
    let mut ext_bytes = 0usize;
    for entry in entries {
        let key_bytes = entry.key.encode();
        let values_block = encode_values_block(&entry.values, unique, metadata_len)?;
        let ext = values_block.len() > EXT_DATA_THRESHOLD;
        entry_bytes += key_bytes.len() + 4; // key + val_length
        if ext {
            entry_bytes += 4; // ext_ptr
            ext_bytes += values_block.len();
        } else {
            entry_bytes += values_block.len();
        }
        layouts.push(EntryLayout {
            key_bytes,
            values_block,
            ext,
        });
    }
    Ok((layouts, entry_bytes, ext_bytes))
}

fn fixed_header_len(has_ext: bool) -> usize {
    // free_byte_length + prev + next [+ ext lengths]
    NODE_PRELUDE_BYTES + 4 + 6 + 6 + if has_ext { 8 } else { 0 }
}

/// Minimum extent able to hold the leaf, without any growth slack.
pub fn leaf_min_extent(entries: &[LeafEntry], unique: bool, metadata_len: usize) -> Result<u32> {
    let (_, entry_bytes, ext_bytes) = layout_entries(entries, unique, metadata_len)?;
    let has_ext = ext_bytes > 0;
    Ok((fixed_header_len(has_ext) + 1 + entry_bytes + ext_bytes) as u32)
}

/// Extent for a freshly written leaf: minimum size plus the configured
/// growth slack for both the entry region and the ext region.
pub fn leaf_planned_extent(entries: &[LeafEntry], unique: bool, metadata_len: usize) -> Result<u32> {
    let (_, entry_bytes, ext_bytes) = layout_entries(entries, unique, metadata_len)?;
    let has_ext = ext_bytes > 0;
    let slack = (entry_bytes * LEAF_FREE_SPACE_PCT as usize) / 100;
    let ext_slack = (ext_bytes * EXT_DATA_FREE_PCT as usize) / 100;
    Ok((fixed_header_len(has_ext) + 1 + entry_bytes + slack + ext_bytes + ext_slack) as u32)
}

/// Serializes the leaf into a full extent image of exactly `extent` bytes.
/// Fails when the extent is too small.
pub fn leaf_image(leaf: &Leaf, unique: bool, metadata_len: usize, extent: u32) -> Result<Vec<u8>> {
    ensure!(
        leaf.entries.len() <= u8::MAX as usize,
        "leaf entry count {} exceeds format ceiling",
        leaf.entries.len()
    );
    let (layouts, entry_bytes, ext_bytes) = layout_entries(&leaf.entries, unique, metadata_len)?;
    let has_ext = ext_bytes > 0;
    let header_len = fixed_header_len(has_ext);
    let used = header_len + 1 + entry_bytes;

    // The ext region takes the extent tail; whatever remains between the
    // entries and the ext region is the free tail.
    ensure!(
        used + ext_bytes <= extent as usize,
        "leaf does not fit extent: need {} have {}",
        used + ext_bytes,
        extent
    );
    let ext_region = if has_ext {
        // The ext region gets half of the leftover slack, the entry region
        // keeps the rest as its free tail.
        let leftover = extent as usize - used - ext_bytes;
        ext_bytes + leftover / 2
    } else {
        0
    };
    let free_len = extent as usize - used - ext_region;

    let mut flags = NODE_FLAG_LEAF;
    if has_ext {
        flags |= NODE_FLAG_HAS_EXT;
    }

    let mut buf = Vec::with_capacity(extent as usize);
    buf.extend_from_slice(&extent.to_be_bytes());
    buf.push(flags);
    buf.extend_from_slice(&(free_len as u32).to_be_bytes());
    write_u48(&mut buf, leaf.prev);
    write_u48(&mut buf, leaf.next);
    if has_ext {
        buf.extend_from_slice(&(ext_region as u32).to_be_bytes());
        buf.extend_from_slice(&((ext_region - ext_bytes) as u32).to_be_bytes());
    }
    buf.push(leaf.entries.len() as u8);

    let mut ext_data: Vec<u8> = Vec::with_capacity(ext_bytes);
    for layout in &layouts {
        buf.extend_from_slice(&layout.key_bytes);
        if layout.ext {
            let val_length = layout.values_block.len() as u32 | EXT_FLAG_BIT;
            buf.extend_from_slice(&val_length.to_be_bytes());
            buf.extend_from_slice(&(ext_data.len() as u32).to_be_bytes());
            ext_data.extend_from_slice(&layout.values_block);
        } else {
            buf.extend_from_slice(&(layout.values_block.len() as u32).to_be_bytes());
            buf.extend_from_slice(&layout.values_block);
        }
    }

    buf.resize(buf.len() + free_len, 0);
    if has_ext {
        buf.extend_from_slice(&ext_data);
        buf.resize(extent as usize, 0);
    }
    debug_assert_eq!(buf.len(), extent as usize);
    Ok(buf)
}

/// Parses a full leaf extent image read at `offset`.
pub fn parse_leaf(bytes: &[u8], offset: u64, unique: bool, metadata_len: usize) -> Result<Leaf> {
    ensure!(bytes.len() >= NODE_PRELUDE_BYTES + 16, "leaf extent too small");
    let extent = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    ensure!(
        extent as usize == bytes.len(),
        "leaf extent length mismatch: header {} buffer {}",
        extent,
        bytes.len()
    );
    let flags = bytes[4];
    ensure!(flags & NODE_FLAG_LEAF != 0, "not a leaf node");
    let has_ext = flags & NODE_FLAG_HAS_EXT != 0;

    let free_len = u32::from_be_bytes(bytes[5..9].try_into().unwrap()) as usize;
    let prev = read_u48(&bytes[9..15]);
    let next = read_u48(&bytes[15..21]);

    let mut at = 21;
    let (ext_region_len, _ext_free) = if has_ext {
        let len = u32::from_be_bytes(bytes[21..25].try_into().unwrap()) as usize;
        let free = u32::from_be_bytes(bytes[25..29].try_into().unwrap()) as usize;
        at = 29;
        (len, free)
    } else {
        (0, 0)
    };
    let ext_start = bytes.len() - ext_region_len;

    let count = bytes[at] as usize;
    at += 1;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let (key, used) = IndexKey::decode(&bytes[at..])?;
        at += used;
        ensure!(bytes.len() >= at + 4, "truncated entry value length");
        let raw_len = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        at += 4;
        let block = if raw_len & EXT_FLAG_BIT != 0 {
            let block_len = (raw_len & !EXT_FLAG_BIT) as usize;
            ensure!(bytes.len() >= at + 4, "truncated ext pointer");
            let ext_ptr = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
            at += 4;
            let start = ext_start + ext_ptr;
            ensure!(
                start + block_len <= bytes.len(),
                "ext values block out of bounds"
            );
            &bytes[start..start + block_len]
        } else {
            let block_len = raw_len as usize;
            ensure!(bytes.len() >= at + block_len, "truncated inline values");
            let block = &bytes[at..at + block_len];
            at += block_len;
            block
        };
        let values = decode_values_block(block, unique, metadata_len)?;
        entries.push(LeafEntry { key, values });
    }

    // The free tail must account for the rest of the entry region.
    if at + free_len + ext_region_len != bytes.len() {
        bail!(
            "leaf free space accounting broken: entries end {} free {} ext {} extent {}",
            at,
            free_len,
            ext_region_len,
            bytes.len()
        );
    }

    Ok(Leaf {
        offset,
        extent,
        prev,
        next,
        entries,
    })
}
