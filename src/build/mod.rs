//! # External Merge-Sort Build Pipeline
//!
//! Builds an index from a primary store of arbitrary size in four
//! stages, each streaming through bounded memory:
//!
//! ```text
//! A  enumerate   store traversal -> <name>.idx.build     (raw records)
//! B  group/sort  batched in-memory maps -> <name>.idx.build.<n> (runs)
//! C  k-way merge run files -> <name>.idx.build.merge
//! D  bulk build  merge file -> <name>.idx.tmp -> rename to <name>.idx
//! ```
//!
//! The run format and the merge format are identical, so the merge output
//! feeds the bulk tree builder without translation, and every stage
//! boundary is a file: a crash leaves the scratch files behind and the
//! driver resumes at the first missing artifact. Records consumed by
//! stage B are flagged in place in the build file (one mutable byte per
//! record), so a partially grouped build file does not re-spill consumed
//! records.
//!
//! - [`spill`]: stage A, store traversal with wildcard fanout caps
//! - [`runs`]: stage B, batch grouping and sorting into runs
//! - [`merge`]: stage C, the k-way merge; also the stage-D entry source

pub mod merge;
pub mod runs;
pub mod spill;

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::btree::{build_tree, TreeBuilderOptions};
use crate::config::{BUILD_FILL_FACTOR, MAX_ENTRIES_PER_NODE, TREE_RESERVED_FREE};
use crate::index::header::{patch_envelope, write_envelope};
use crate::index::IndexDefinition;
use crate::io::{BinaryWriter, FileWriter};
use crate::store::NodeStore;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

pub fn build_path(index_path: &Path) -> PathBuf {
    with_suffix(index_path, ".build")
}

pub fn run_path(index_path: &Path, n: usize) -> PathBuf {
    with_suffix(index_path, &format!(".build.{}", n))
}

pub fn merge_path(index_path: &Path) -> PathBuf {
    with_suffix(index_path, ".build.merge")
}

pub fn tmp_path(index_path: &Path) -> PathBuf {
    with_suffix(index_path, ".tmp")
}

/// Run files present on disk, in run order.
fn existing_runs(index_path: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for n in 0.. {
        let path = run_path(index_path, n);
        if !path.exists() {
            break;
        }
        paths.push(path);
    }
    paths
}

/// Builds the index file at `index_path` from the primary store. Scratch
/// files from an interrupted build are picked up where they left off; on
/// success all scratch is deleted and the tmp file is renamed over the
/// index file.
pub fn build_index(store: &dyn NodeStore, def: &IndexDefinition, index_path: &Path) -> Result<()> {
    let build_file = build_path(index_path);
    let merge_file = merge_path(index_path);
    let metadata_keys = def.metadata_keys();

    if !merge_file.exists() {
        if !build_file.exists() {
            debug!(index = %def.description(), "stage A: enumerating primary store");
            spill::enumerate(store, def, &build_file)?;
        } else {
            debug!(index = %def.description(), "stage A artifact present, resuming");
        }

        debug!(index = %def.description(), "stage B: grouping and sorting into runs");
        let runs = runs::spill_runs(def, &build_file, index_path)?;

        debug!(index = %def.description(), runs = runs.len(), "stage C: merging runs");
        merge::merge_runs(&runs, &merge_file, metadata_keys.len())?;
    } else {
        debug!(index = %def.description(), "merge artifact present, resuming at bulk build");
    }

    debug!(index = %def.description(), "stage D: bulk building the tree");
    let staging = tmp_path(index_path);
    let mut source = merge::MergeEntrySource::open(&merge_file, metadata_keys.len())?;
    let mut writer = FileWriter::create(&staging)?;
    let layout = write_envelope(&mut writer, def)?;
    let opts = TreeBuilderOptions {
        entries_per_node: MAX_ENTRIES_PER_NODE,
        fill_factor: BUILD_FILL_FACTOR,
        unique: false,
        metadata_keys,
        reserved_free: TREE_RESERVED_FREE,
    };
    let stats = build_tree(&mut source, &mut writer, &opts)?;
    patch_envelope(
        &mut writer,
        &layout,
        stats.byte_length,
        stats.entry_count,
        stats.value_count,
    )?;
    writer.sync()?;

    std::fs::rename(&staging, index_path)
        .wrap_err_with(|| format!("committing built index {}", index_path.display()))?;

    // Success: drop every scratch artifact.
    let _ = std::fs::remove_file(&build_file);
    let _ = std::fs::remove_file(&merge_file);
    for run in existing_runs(index_path) {
        let _ = std::fs::remove_file(run);
    }
    debug!(
        index = %def.description(),
        entries = stats.entry_count,
        values = stats.value_count,
        "index build committed"
    );
    Ok(())
}
