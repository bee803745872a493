//! # Stage C: K-Way Merge
//!
//! Merges every run file into one ordered merge file. Each run is read
//! through its own chunked reader; an insertion-sorted list of run
//! cursors tracks the smallest current key. Runs holding the same key
//! have their value lists concatenated into a single merged entry, so the
//! merge output holds every key exactly once, which is what the bulk
//! builder requires.
//!
//! The merge file reuses the run entry format, which also makes it the
//! stage-D entry source: [`MergeEntrySource`] wraps it as a rewindable
//! ordered stream for the tree builder.

use std::path::Path;

use eyre::Result;

use super::runs::{read_run_entry, write_run_entry};
use crate::btree::builder::EntrySource;
use crate::btree::{EntryValue, LeafEntry};
use crate::encoding::IndexKey;
use crate::io::{BinaryReader, BinaryWriter, FileWriter};

struct RunCursor {
    reader: BinaryReader,
    current: Option<(IndexKey, Vec<EntryValue>)>,
}

impl RunCursor {
    fn advance(&mut self, metadata_len: usize) -> Result<()> {
        self.current = read_run_entry(&mut self.reader, metadata_len)?;
        Ok(())
    }

    fn key(&self) -> &IndexKey {
        &self.current.as_ref().expect("cursor exhausted").0
    }
}

/// Inserts `run` into `order`, keeping it sorted by the cursors' current
/// keys.
fn insert_sorted(order: &mut Vec<usize>, cursors: &[RunCursor], run: usize) {
    let key = cursors[run].key();
    let pos = order
        .iter()
        .position(|&other| key < cursors[other].key())
        .unwrap_or(order.len());
    order.insert(pos, run);
}

pub fn merge_runs(run_paths: &[std::path::PathBuf], merge_file: &Path, metadata_len: usize) -> Result<()> {
    let mut writer = FileWriter::create(merge_file)?;

    let mut cursors: Vec<RunCursor> = Vec::with_capacity(run_paths.len());
    for path in run_paths {
        let mut cursor = RunCursor {
            reader: BinaryReader::open(path)?,
            current: None,
        };
        cursor.advance(metadata_len)?;
        cursors.push(cursor);
    }

    let mut order: Vec<usize> = Vec::new();
    for run in 0..cursors.len() {
        if cursors[run].current.is_some() {
            insert_sorted(&mut order, &cursors, run);
        }
    }

    while let Some(&first) = order.first() {
        order.remove(0);
        let (key, mut values) = cursors[first].current.take().expect("ordered cursor");
        cursors[first].advance(metadata_len)?;

        // Equal keys sit at the front of the sorted order; fold them in.
        let mut advanced = vec![first];
        while let Some(&next) = order.first() {
            if *cursors[next].key() != key {
                break;
            }
            order.remove(0);
            let (_, more) = cursors[next].current.take().expect("ordered cursor");
            values.extend(more);
            cursors[next].advance(metadata_len)?;
            advanced.push(next);
        }

        write_run_entry(&mut writer, &key, &values, metadata_len)?;

        for run in advanced {
            if cursors[run].current.is_some() {
                insert_sorted(&mut order, &cursors, run);
            }
        }
    }

    writer.sync()?;
    Ok(())
}

/// The merge file as a rewindable ordered entry stream for the bulk tree
/// builder.
pub struct MergeEntrySource {
    reader: BinaryReader,
    metadata_len: usize,
}

impl MergeEntrySource {
    pub fn open(merge_file: &Path, metadata_len: usize) -> Result<Self> {
        Ok(Self {
            reader: BinaryReader::open(merge_file)?,
            metadata_len,
        })
    }
}

impl EntrySource for MergeEntrySource {
    fn next_entry(&mut self) -> Result<Option<LeafEntry>> {
        Ok(read_run_entry(&mut self.reader, self.metadata_len)?
            .map(|(key, values)| LeafEntry { key, values }))
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(0);
        Ok(())
    }
}
