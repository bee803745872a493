//! # Index File Envelope
//!
//! Every index file starts with a self-describing envelope ahead of the
//! tree region:
//!
//! ```text
//! signature        10 bytes   "ACEBASEIDX"
//! layout_version   u8         (1)
//! header_length    u32        tree region offset, 4096-aligned
//! index_info       typed map  { type, version, path, key, include,
//!                               cs, locale }
//! trees_count      u8         (1)
//! per tree:
//!   tree_name      u8 len + bytes ("default")
//!   file_index     u32        == header_length
//!   byte_length    u32        patched when the build finishes
//!   tree_info      typed map  { class, version, entries, values }
//! padding          zeros to the next 4096 boundary
//! ```
//!
//! Typed-map values reuse the key codec (UNDEFINED, STRING, NUMBER,
//! BOOLEAN, ARRAY tags). A wrong signature, an unknown layout version or
//! an unknown value tag fails with `UnsupportedFormat`; the caller is
//! expected to rebuild the index from the primary store.
//!
//! The writer records the byte offsets of `byte_length` and of the
//! `entries`/`values` numbers inside `tree_info`, so the builder can
//! reserve the envelope up front, stream the tree, and patch the three
//! fields afterwards.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{IndexDefinition, IndexType};
use crate::config::TREE_BLOCK_ALIGN;
use crate::encoding::key::TAG_INTEGER;
use crate::encoding::IndexKey;
use crate::error::IndexError;
use crate::io::{BinaryReader, BinaryWriter};
use crate::path::PathInfo;

pub const SIGNATURE: &[u8; 10] = b"ACEBASEIDX";
pub const LAYOUT_VERSION: u8 = 1;
pub const DEFAULT_TREE_NAME: &str = "default";

const ENVELOPE_PRELUDE_SIZE: usize = 15;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EnvelopePrelude {
    signature: [u8; 10],
    layout_version: u8,
    header_length: U32,
}

const _: () = assert!(std::mem::size_of::<EnvelopePrelude>() == ENVELOPE_PRELUDE_SIZE);

fn write_map(buf: &mut Vec<u8>, entries: &[(&str, IndexKey)]) {
    debug_assert!(entries.len() <= u8::MAX as usize);
    buf.push(entries.len() as u8);
    for (name, value) in entries {
        debug_assert!(name.len() <= u8::MAX as usize);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
        value.encode_to(buf);
    }
}

fn read_map(buf: &[u8]) -> Result<(Vec<(String, IndexKey)>, usize)> {
    ensure!(!buf.is_empty(), "truncated typed map");
    let count = buf[0] as usize;
    let mut at = 1;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        ensure!(at < buf.len(), "truncated map key length");
        let len = buf[at] as usize;
        at += 1;
        ensure!(at + len <= buf.len(), "truncated map key");
        let name = std::str::from_utf8(&buf[at..at + len])?.to_string();
        at += len;
        let (value, used) = IndexKey::decode(&buf[at..]).map_err(|e| {
            eyre::Report::from(IndexError::UnsupportedFormat(format!(
                "bad typed-map value for {:?}: {}",
                name, e
            )))
        })?;
        entries.push((name, value));
        at += used;
    }
    Ok((entries, at))
}

fn map_get<'a>(map: &'a [(String, IndexKey)], name: &str) -> Result<&'a IndexKey> {
    map.iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
        .ok_or_else(|| {
            IndexError::UnsupportedFormat(format!("missing {:?} in index header", name)).into()
        })
}

fn map_string(map: &[(String, IndexKey)], name: &str) -> Result<String> {
    match map_get(map, name)? {
        IndexKey::String(s) => Ok(s.clone()),
        other => Err(IndexError::UnsupportedFormat(format!(
            "expected string for {:?}, got {}",
            name, other
        ))
        .into()),
    }
}

fn map_int(map: &[(String, IndexKey)], name: &str) -> Result<i64> {
    match map_get(map, name)? {
        IndexKey::Integer(v) => Ok(*v),
        other => Err(IndexError::UnsupportedFormat(format!(
            "expected number for {:?}, got {}",
            name, other
        ))
        .into()),
    }
}

/// Offsets the builder patches once the tree bytes are known.
#[derive(Debug, Clone)]
pub struct EnvelopeLayout {
    pub header_length: u32,
    pub byte_length_field: u64,
    pub entries_field: u64,
    pub values_field: u64,
}

/// Writes the envelope for `def`, padded to the block boundary, and
/// returns the patchable field offsets. The writer is left positioned at
/// the tree region start.
pub fn write_envelope(writer: &mut dyn BinaryWriter, def: &IndexDefinition) -> Result<EnvelopeLayout> {
    let base = writer.position();
    let mut buf = Vec::with_capacity(256);

    buf.extend_from_slice(SIGNATURE);
    buf.push(LAYOUT_VERSION);
    let header_length_field = buf.len();
    buf.extend_from_slice(&0u32.to_be_bytes()); // patched below

    let include = IndexKey::Array(
        def.include_keys
            .iter()
            .map(|k| IndexKey::String(k.clone()))
            .collect(),
    );
    write_map(
        &mut buf,
        &[
            ("type", IndexKey::String(def.index_type.as_str().to_string())),
            ("version", IndexKey::Integer(1)),
            ("path", IndexKey::String(def.path.source().to_string())),
            ("key", IndexKey::String(def.key.clone())),
            ("include", include),
            ("cs", IndexKey::Boolean(def.case_sensitive)),
            ("locale", IndexKey::String(def.locale.clone())),
        ],
    );

    buf.push(1); // trees_count
    buf.push(DEFAULT_TREE_NAME.len() as u8);
    buf.extend_from_slice(DEFAULT_TREE_NAME.as_bytes());
    let file_index_field = buf.len();
    buf.extend_from_slice(&0u32.to_be_bytes()); // patched below
    let byte_length_field = buf.len();
    buf.extend_from_slice(&0u32.to_be_bytes());

    // tree_info; entries/values payloads get patched, so note where the
    // integer payloads land.
    buf.push(4);
    buf.push(5);
    buf.extend_from_slice(b"class");
    IndexKey::String("BPlusTree".to_string()).encode_to(&mut buf);
    buf.push(7);
    buf.extend_from_slice(b"version");
    IndexKey::Integer(1).encode_to(&mut buf);
    buf.push(7);
    buf.extend_from_slice(b"entries");
    buf.push(TAG_INTEGER);
    let entries_field = buf.len();
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf.push(6);
    buf.extend_from_slice(b"values");
    buf.push(TAG_INTEGER);
    let values_field = buf.len();
    buf.extend_from_slice(&0i64.to_be_bytes());

    // Pad to the block boundary; the tree region starts aligned.
    let header_length = (buf.len() as u32).next_multiple_of(TREE_BLOCK_ALIGN);
    buf[header_length_field..header_length_field + 4]
        .copy_from_slice(&header_length.to_be_bytes());
    buf[file_index_field..file_index_field + 4].copy_from_slice(&header_length.to_be_bytes());
    buf.resize(header_length as usize, 0);

    writer.append(&buf)?;
    Ok(EnvelopeLayout {
        header_length,
        byte_length_field: base + byte_length_field as u64,
        entries_field: base + entries_field as u64,
        values_field: base + values_field as u64,
    })
}

pub fn patch_envelope(
    writer: &mut dyn BinaryWriter,
    layout: &EnvelopeLayout,
    tree_byte_length: u32,
    entries: u64,
    values: u64,
) -> Result<()> {
    writer.write_at(&tree_byte_length.to_be_bytes(), layout.byte_length_field)?;
    writer.write_at(&(entries as i64).to_be_bytes(), layout.entries_field)?;
    writer.write_at(&(values as i64).to_be_bytes(), layout.values_field)?;
    Ok(())
}

/// Decoded envelope of an existing index file.
#[derive(Debug, Clone)]
pub struct EnvelopeInfo {
    pub def: IndexDefinition,
    pub header_length: u32,
    pub tree_byte_length: u32,
    pub entry_count: u64,
    pub value_count: u64,
}

pub fn read_envelope(path: &Path) -> Result<EnvelopeInfo> {
    let mut reader = BinaryReader::open(path)
        .wrap_err_with(|| format!("opening index file {}", path.display()))?;

    let prelude_bytes = reader.get(ENVELOPE_PRELUDE_SIZE)?;
    let prelude = EnvelopePrelude::ref_from_bytes(&prelude_bytes)
        .map_err(|e| eyre::eyre!("failed to parse envelope prelude: {:?}", e))?;
    if &prelude.signature != SIGNATURE {
        return Err(IndexError::UnsupportedFormat("bad signature".to_string()).into());
    }
    if prelude.layout_version != LAYOUT_VERSION {
        return Err(IndexError::UnsupportedFormat(format!(
            "layout version {}",
            prelude.layout_version
        ))
        .into());
    }
    let header_length = prelude.header_length.get();
    ensure!(
        header_length as u64 <= reader.len(),
        "header length {} beyond file end {}",
        header_length,
        reader.len()
    );

    reader.seek(0);
    let header = reader.get(header_length as usize)?;
    let mut at = ENVELOPE_PRELUDE_SIZE;

    let (info, used) = read_map(&header[at..])?;
    at += used;

    let index_type = IndexType::parse(&map_string(&info, "type")?)?;
    let def = IndexDefinition {
        path: PathInfo::parse(&map_string(&info, "path")?)?,
        key: map_string(&info, "key")?,
        include_keys: match map_get(&info, "include")? {
            IndexKey::Array(items) => items
                .iter()
                .map(|item| match item {
                    IndexKey::String(s) => Ok(s.clone()),
                    other => Err(eyre::Report::from(IndexError::UnsupportedFormat(format!(
                        "non-string include key {}",
                        other
                    )))),
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(IndexError::UnsupportedFormat(format!(
                    "expected array for include, got {}",
                    other
                ))
                .into())
            }
        },
        case_sensitive: matches!(map_get(&info, "cs")?, IndexKey::Boolean(true)),
        locale: map_string(&info, "locale")?,
        index_type,
    };

    ensure!(header.len() > at, "truncated tree count");
    let trees_count = header[at];
    at += 1;
    ensure!(trees_count == 1, "unexpected tree count {}", trees_count);

    ensure!(header.len() > at, "truncated tree name");
    let name_len = header[at] as usize;
    at += 1 + name_len;
    ensure!(header.len() >= at + 8, "truncated tree descriptor");
    let file_index = u32::from_be_bytes(header[at..at + 4].try_into().unwrap());
    at += 4;
    let tree_byte_length = u32::from_be_bytes(header[at..at + 4].try_into().unwrap());
    at += 4;
    ensure!(
        file_index == header_length,
        "tree file index {} does not match header length {}",
        file_index,
        header_length
    );

    let (tree_info, _) = read_map(&header[at..])?;
    let entry_count = map_int(&tree_info, "entries")? as u64;
    let value_count = map_int(&tree_info, "values")? as u64;

    Ok(EnvelopeInfo {
        def,
        header_length,
        tree_byte_length,
        entry_count,
        value_count,
    })
}
