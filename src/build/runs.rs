//! # Stage B: Batch Group & Sort
//!
//! Re-reads the build file sequentially, grouping records by key in an
//! in-memory map of at most `BATCH_MAX_VALUES` values. A full batch is
//! sorted by the total key order and spilled as a run file:
//!
//! ```text
//! run entry: entry_length u32      bytes after this field
//!            key          typed
//!            values_count u32
//!            value × count { value_length u32, value bytes }
//! ```
//!
//! A record whose key already sits in the current batch merges in past
//! the cap, keeping equal keys together in one run. After each spill the
//! consumed records' `processed` flags are set in place in the build
//! file, so a crashed build resumes without duplicating them.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::debug;

use super::run_path;
use crate::btree::leaf::{decode_value_bytes, encode_value_bytes};
use crate::btree::EntryValue;
use crate::config::BATCH_MAX_VALUES;
use crate::encoding::IndexKey;
use crate::error::IndexError;
use crate::index::IndexDefinition;
use crate::io::{BinaryReader, BinaryWriter, FileWriter};

struct BuildRecord {
    /// File offset of the record's `processed` flag byte.
    flag_offset: u64,
    key: IndexKey,
    value: EntryValue,
}

/// Reads the next live record at the reader position, skipping records
/// already flagged as processed. `None` at end of file.
fn read_record(
    reader: &mut BinaryReader,
    metadata_len: usize,
) -> Result<Option<BuildRecord>> {
    loop {
        let start = reader.position();
        let entry_length = match reader.get_u32() {
            Ok(len) => len as u64,
            Err(err) if IndexError::is_eof(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        let body = reader.get(entry_length as usize)?;
        ensure!(body.len() >= 2, "truncated build record");
        if body[0] != 0 {
            continue; // already consumed by an earlier, interrupted run
        }
        let mut at = 1;
        let (key, used) = IndexKey::decode(&body[at..])?;
        at += used;
        let rp_len = body[at] as usize;
        at += 1;
        ensure!(body.len() >= at + rp_len, "truncated record pointer");
        let record_pointer = body[at..at + rp_len].to_vec();
        at += rp_len;
        let mut metadata = Vec::with_capacity(metadata_len);
        for _ in 0..metadata_len {
            let (value, used) = IndexKey::decode(&body[at..])?;
            metadata.push(value);
            at += used;
        }
        return Ok(Some(BuildRecord {
            flag_offset: start + 4,
            key,
            value: EntryValue {
                record_pointer,
                metadata,
            },
        }));
    }
}

pub(crate) fn write_run_entry(
    writer: &mut dyn BinaryWriter,
    key: &IndexKey,
    values: &[EntryValue],
    metadata_len: usize,
) -> Result<()> {
    let mut body = Vec::with_capacity(64);
    key.encode_to(&mut body);
    body.extend_from_slice(&(values.len() as u32).to_be_bytes());
    for value in values {
        let bytes = encode_value_bytes(value, metadata_len)?;
        body.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        body.extend_from_slice(&bytes);
    }
    writer.append(&(body.len() as u32).to_be_bytes())?;
    writer.append(&body)?;
    Ok(())
}

/// Reads one run entry, or `None` on end of file.
pub(crate) fn read_run_entry(
    reader: &mut BinaryReader,
    metadata_len: usize,
) -> Result<Option<(IndexKey, Vec<EntryValue>)>> {
    let entry_length = match reader.get_u32() {
        Ok(len) => len as usize,
        Err(err) if IndexError::is_eof(&err) => return Ok(None),
        Err(err) => return Err(err),
    };
    let body = reader.get(entry_length)?;
    let (key, mut at) = IndexKey::decode(&body)?;
    ensure!(body.len() >= at + 4, "truncated run values count");
    let count = u32::from_be_bytes(body[at..at + 4].try_into().unwrap()) as usize;
    at += 4;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        ensure!(body.len() >= at + 4, "truncated run value length");
        let len = u32::from_be_bytes(body[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        let (value, used) = decode_value_bytes(&body[at..at + len], metadata_len)?;
        ensure!(used == len, "run value length mismatch");
        values.push(value);
        at += len;
    }
    Ok(Some((key, values)))
}

/// Runs stage B over the build file. Returns every run file belonging to
/// the build, including runs spilled before an interruption.
pub fn spill_runs(
    def: &IndexDefinition,
    build_file: &Path,
    index_path: &Path,
) -> Result<Vec<PathBuf>> {
    let metadata_len = def.metadata_keys().len();
    let mut reader = BinaryReader::open(build_file)?;
    let mut flag_writer = OpenOptions::new()
        .write(true)
        .open(build_file)
        .wrap_err_with(|| format!("opening {} for flagging", build_file.display()))?;

    let mut runs = super::existing_runs(index_path);
    let mut run_no = runs.len();

    loop {
        // key bytes -> grouped values, plus consumed flag offsets.
        let mut batch: HashMap<Vec<u8>, (IndexKey, Vec<EntryValue>)> = HashMap::new();
        let mut flags: Vec<u64> = Vec::new();
        let mut value_count = 0usize;

        loop {
            let rollback = reader.position();
            let Some(record) = read_record(&mut reader, metadata_len)? else {
                break;
            };
            let key_bytes = record.key.encode();
            if value_count >= BATCH_MAX_VALUES && !batch.contains_key(&key_bytes) {
                // Batch is full and this key opens a new group; leave the
                // record for the next batch.
                reader.seek(rollback);
                break;
            }
            batch
                .entry(key_bytes)
                .or_insert_with(|| (record.key, Vec::new()))
                .1
                .push(record.value);
            flags.push(record.flag_offset);
            value_count += 1;
        }

        if batch.is_empty() {
            break;
        }

        let mut entries: Vec<(IndexKey, Vec<EntryValue>)> = batch.into_values().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let path = run_path(index_path, run_no);
        let mut writer = FileWriter::create(&path)?;
        for (key, values) in &entries {
            write_run_entry(&mut writer, key, values, metadata_len)?;
        }
        writer.sync()?;
        debug!(
            run = %path.display(),
            keys = entries.len(),
            values = value_count,
            "run file spilled"
        );
        runs.push(path);
        run_no += 1;

        // Flag the consumed records so a restart skips them.
        for offset in flags {
            flag_writer.seek(SeekFrom::Start(offset))?;
            flag_writer.write_all(&[1])?;
        }
        flag_writer.sync_all()?;
    }

    Ok(runs)
}
