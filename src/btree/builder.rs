//! # Bulk Tree Construction
//!
//! The initial build and every rebuild share this bottom-up builder. Input
//! is an ordered stream of entries (strictly ascending keys; equal keys
//! must be merged upstream) that can be rewound, because construction runs
//! in two passes:
//!
//! 1. **Size pass**: stream the entries once, simulate leaf packing at the
//!    configured fill factor, and record each leaf's first key and planned
//!    extent. Interior levels are then shaped in memory from the first
//!    keys alone: children group under parents `entries_per_node + 1` at a
//!    time, and a trailing parent that would fall under half occupancy
//!    borrows children from its left sibling, replaying the moved
//!    subtree's smallest key as the routing key. Since pointers have a
//!    fixed width, every node's exact extent, and therefore every node's
//!    offset, is known before anything is written.
//!
//! 2. **Emit pass**: rewind the source and write the region in one
//!    sequential sweep: tree header, interior levels root-first, then the
//!    leaves in key order with their chain pointers, then the reserved
//!    free tail. Nothing needs forward patching; the caller patches outer
//!    envelope fields (tree byte length, entry counts) afterwards through
//!    the writer's `write_at`.
//!
//! The two passes must batch identically; both run the same packing loop
//! over the same source.

use eyre::{bail, ensure, Result};

use super::header::{encode_tree_header, tree_header_len, TreeState};
use super::interior::{interior_image, interior_planned_extent, InteriorEntry};
use super::leaf::{leaf_image, leaf_planned_extent, Leaf, LeafEntry};
use crate::config::{BUILD_FILL_FACTOR, MAX_ENTRIES_PER_NODE, TREE_RESERVED_FREE};
use crate::encoding::IndexKey;
use crate::io::BinaryWriter;

/// Ordered, rewindable entry stream feeding the builder.
pub trait EntrySource {
    fn next_entry(&mut self) -> Result<Option<LeafEntry>>;

    /// Restarts the stream from the first entry. Both builder passes
    /// consume the source fully.
    fn rewind(&mut self) -> Result<()>;
}

/// In-memory source for small builds and tests.
pub struct VecEntrySource {
    entries: Vec<LeafEntry>,
    at: usize,
}

impl VecEntrySource {
    pub fn new(entries: Vec<LeafEntry>) -> Self {
        Self { entries, at: 0 }
    }
}

impl EntrySource for VecEntrySource {
    fn next_entry(&mut self) -> Result<Option<LeafEntry>> {
        if self.at >= self.entries.len() {
            return Ok(None);
        }
        let entry = self.entries[self.at].clone();
        self.at += 1;
        Ok(Some(entry))
    }

    fn rewind(&mut self) -> Result<()> {
        self.at = 0;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TreeBuilderOptions {
    pub entries_per_node: u8,
    pub fill_factor: u8,
    pub unique: bool,
    pub metadata_keys: Vec<String>,
    pub reserved_free: u32,
}

impl Default for TreeBuilderOptions {
    fn default() -> Self {
        Self {
            entries_per_node: MAX_ENTRIES_PER_NODE,
            fill_factor: BUILD_FILL_FACTOR,
            unique: false,
            metadata_keys: Vec::new(),
            reserved_free: TREE_RESERVED_FREE,
        }
    }
}

impl TreeBuilderOptions {
    fn entries_per_leaf(&self) -> usize {
        ((self.entries_per_node as usize * self.fill_factor as usize) / 100).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct BuildStats {
    pub byte_length: u32,
    pub free_bytes: u32,
    pub depth: u8,
    pub entry_count: u64,
    pub value_count: u64,
    pub leaf_count: u64,
}

#[derive(Debug, Clone)]
struct NodePlan {
    first_key: IndexKey,
    extent: u32,
    offset: u64,
    /// Child range in the level below; unused for leaves.
    children: (usize, usize),
}

/// Groups `count` children into parents of at most `max_children`,
/// rebalancing a trailing runt against its left sibling.
fn chunk_children(count: usize, max_children: usize, min_entries: usize) -> Vec<(usize, usize)> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < count {
        let end = (start + max_children).min(count);
        chunks.push((start, end));
        start = end;
    }
    let n = chunks.len();
    if n >= 2 {
        let last = chunks[n - 1];
        // entries = children - 1
        if (last.1 - last.0) < min_entries + 1 {
            let prev = chunks[n - 2];
            let total = (prev.1 - prev.0) + (last.1 - last.0);
            let left = total.div_ceil(2);
            chunks[n - 2] = (prev.0, prev.0 + left);
            chunks[n - 1] = (prev.0 + left, last.1);
        }
    }
    chunks
}

pub fn build_tree(
    source: &mut dyn EntrySource,
    writer: &mut dyn BinaryWriter,
    opts: &TreeBuilderOptions,
) -> Result<BuildStats> {
    ensure!(opts.entries_per_node >= 2, "entries_per_node must be >= 2");
    ensure!(
        (1..=100).contains(&opts.fill_factor),
        "fill factor {} out of range",
        opts.fill_factor
    );
    let per_leaf = opts.entries_per_leaf();
    let metadata_len = opts.metadata_keys.len();

    // Pass 1: plan leaves.
    let mut leaves: Vec<NodePlan> = Vec::new();
    let mut batch: Vec<LeafEntry> = Vec::with_capacity(per_leaf);
    let mut entry_count = 0u64;
    let mut value_count = 0u64;
    let mut last_key: Option<IndexKey> = None;

    let mut flush = |batch: &mut Vec<LeafEntry>, leaves: &mut Vec<NodePlan>| -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let extent = leaf_planned_extent(batch, opts.unique, metadata_len)?;
        leaves.push(NodePlan {
            first_key: batch[0].key.clone(),
            extent,
            offset: 0,
            children: (0, 0),
        });
        batch.clear();
        Ok(())
    };

    while let Some(entry) = source.next_entry()? {
        if let Some(prev) = &last_key {
            ensure!(
                *prev < entry.key,
                "entry stream not strictly ascending at key {}",
                entry.key
            );
        }
        if opts.unique && entry.values.len() > 1 {
            bail!("unique tree cannot hold {} values for one key", entry.values.len());
        }
        last_key = Some(entry.key.clone());
        entry_count += 1;
        value_count += entry.values.len() as u64;
        batch.push(entry);
        if batch.len() == per_leaf {
            flush(&mut batch, &mut leaves)?;
        }
    }
    flush(&mut batch, &mut leaves)?;

    if leaves.is_empty() {
        let empty: Vec<LeafEntry> = Vec::new();
        leaves.push(NodePlan {
            first_key: IndexKey::Undefined,
            extent: leaf_planned_extent(&empty, opts.unique, metadata_len)?,
            offset: 0,
            children: (0, 0),
        });
    }

    // Shape the interior levels bottom-up.
    let max_children = opts.entries_per_node as usize + 1;
    let min_entries = opts.entries_per_node as usize / 2;
    let mut interior_levels: Vec<Vec<NodePlan>> = Vec::new();
    {
        let mut lower_keys: Vec<IndexKey> = leaves.iter().map(|l| l.first_key.clone()).collect();
        while lower_keys.len() > 1 {
            let chunks = chunk_children(lower_keys.len(), max_children, min_entries);
            let mut level = Vec::with_capacity(chunks.len());
            let mut level_keys = Vec::with_capacity(chunks.len());
            for (start, end) in chunks {
                // Extent depends only on routing keys; pointers are fixed
                // width, so placeholder targets size identically.
                let routing: Vec<InteriorEntry> = lower_keys[start + 1..end]
                    .iter()
                    .map(|k| InteriorEntry {
                        key: k.clone(),
                        lt_child: 0,
                    })
                    .collect();
                level.push(NodePlan {
                    first_key: lower_keys[start].clone(),
                    extent: interior_planned_extent(&routing),
                    offset: 0,
                    children: (start, end),
                });
                level_keys.push(lower_keys[start].clone());
            }
            interior_levels.push(level);
            lower_keys = level_keys;
        }
    }

    // Assign offsets: header, root level down to the lowest interior
    // level, then the leaves in key order.
    let header_len = tree_header_len(&opts.metadata_keys);
    let mut cursor = header_len as u64;
    for level in interior_levels.iter_mut().rev() {
        for node in level.iter_mut() {
            node.offset = cursor;
            cursor += node.extent as u64;
        }
    }
    for leaf in leaves.iter_mut() {
        leaf.offset = cursor;
        cursor += leaf.extent as u64;
    }
    let byte_length = u32::try_from(cursor)
        .map_err(|_| eyre::eyre!("tree region exceeds 4 GiB: {} bytes", cursor))?;

    let depth = (interior_levels.len() + 1) as u8;
    let root_ptr = match interior_levels.last() {
        Some(root_level) => root_level[0].offset,
        None => leaves[0].offset,
    };

    // Pass 2: emit.
    let base = writer.position();
    let state = TreeState {
        byte_length,
        free_bytes: opts.reserved_free,
        root_ptr,
        depth,
        unique: opts.unique,
        entries_per_node: opts.entries_per_node,
        fill_factor: opts.fill_factor,
        metadata_keys: opts.metadata_keys.clone(),
        header_len,
    };
    writer.append(&encode_tree_header(&state)?)?;

    for level_idx in (0..interior_levels.len()).rev() {
        // Clone the child plans we need so the level itself can be
        // iterated immutably.
        let lower: Vec<(IndexKey, u64)> = if level_idx == 0 {
            leaves.iter().map(|l| (l.first_key.clone(), l.offset)).collect()
        } else {
            interior_levels[level_idx - 1]
                .iter()
                .map(|n| (n.first_key.clone(), n.offset))
                .collect()
        };
        for node in &interior_levels[level_idx] {
            let (start, end) = node.children;
            let children = &lower[start..end];
            let entries: Vec<InteriorEntry> = children
                .windows(2)
                .map(|pair| InteriorEntry {
                    key: pair[1].0.clone(),
                    lt_child: pair[0].1,
                })
                .collect();
            let gt_child = children[children.len() - 1].1;
            debug_assert_eq!(writer.position() - base, node.offset);
            writer.append(&interior_image(&entries, gt_child, node.extent)?)?;
        }
    }

    // Re-stream the entries into the planned leaves.
    source.rewind()?;
    let mut batch: Vec<LeafEntry> = Vec::with_capacity(per_leaf);
    let mut leaf_idx = 0usize;
    let mut emit = |batch: &mut Vec<LeafEntry>, leaf_idx: &mut usize| -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let plan = &leaves[*leaf_idx];
        let leaf = Leaf {
            offset: plan.offset,
            extent: plan.extent,
            prev: if *leaf_idx > 0 {
                leaves[*leaf_idx - 1].offset
            } else {
                0
            },
            next: if *leaf_idx + 1 < leaves.len() {
                leaves[*leaf_idx + 1].offset
            } else {
                0
            },
            entries: std::mem::take(batch),
        };
        debug_assert_eq!(writer.position() - base, plan.offset);
        writer.append(&leaf_image(&leaf, opts.unique, metadata_len, plan.extent)?)?;
        *leaf_idx += 1;
        Ok(())
    };

    while let Some(entry) = source.next_entry()? {
        batch.push(entry);
        if batch.len() == per_leaf {
            emit(&mut batch, &mut leaf_idx)?;
        }
    }
    emit(&mut batch, &mut leaf_idx)?;

    if leaf_idx == 0 {
        // Empty tree: one empty leaf as root.
        let plan = &leaves[0];
        let leaf = Leaf {
            offset: plan.offset,
            extent: plan.extent,
            prev: 0,
            next: 0,
            entries: Vec::new(),
        };
        writer.append(&leaf_image(&leaf, opts.unique, metadata_len, plan.extent)?)?;
        leaf_idx = 1;
    }
    ensure!(
        leaf_idx == leaves.len(),
        "emit pass produced {} leaves, size pass planned {}",
        leaf_idx,
        leaves.len()
    );
    ensure!(
        writer.position() - base == byte_length as u64,
        "emit pass wrote {} bytes, size pass planned {}",
        writer.position() - base,
        byte_length
    );

    // Reserved free tail.
    let zeros = vec![0u8; 8192];
    let mut remaining = opts.reserved_free as usize;
    while remaining > 0 {
        let n = remaining.min(zeros.len());
        writer.append(&zeros[..n])?;
        remaining -= n;
    }

    Ok(BuildStats {
        byte_length,
        free_bytes: opts.reserved_free,
        depth,
        entry_count,
        value_count,
        leaf_count: leaves.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::leaf::EntryValue;
    use crate::io::BufferWriter;

    fn entries(n: i64) -> Vec<LeafEntry> {
        (0..n)
            .map(|i| LeafEntry {
                key: IndexKey::Integer(i),
                values: vec![EntryValue {
                    record_pointer: format!("r{}", i).into_bytes(),
                    metadata: Vec::new(),
                }],
            })
            .collect()
    }

    fn build(n: i64, opts: &TreeBuilderOptions) -> (Vec<u8>, BuildStats) {
        let mut source = VecEntrySource::new(entries(n));
        let mut writer = BufferWriter::new();
        let stats = build_tree(&mut source, &mut writer, opts).unwrap();
        (writer.into_bytes(), stats)
    }

    #[test]
    fn single_leaf_tree() {
        let opts = TreeBuilderOptions::default();
        let (bytes, stats) = build(10, &opts);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.leaf_count, 1);
        assert_eq!(stats.entry_count, 10);
        assert_eq!(
            bytes.len() as u64,
            stats.byte_length as u64 + stats.free_bytes as u64
        );
    }

    #[test]
    fn multi_level_tree_has_interiors_before_leaves() {
        let opts = TreeBuilderOptions {
            entries_per_node: 4,
            fill_factor: 100,
            ..Default::default()
        };
        let (_bytes, stats) = build(100, &opts);
        // 25 leaves, 5 parents, 1 root
        assert_eq!(stats.leaf_count, 25);
        assert_eq!(stats.depth, 3);
    }

    #[test]
    fn empty_source_builds_empty_leaf_root() {
        let opts = TreeBuilderOptions::default();
        let (_bytes, stats) = build(0, &opts);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.leaf_count, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[test]
    fn unsorted_source_is_rejected() {
        let mut items = entries(5);
        items.swap(1, 3);
        let mut source = VecEntrySource::new(items);
        let mut writer = BufferWriter::new();
        let err = build_tree(&mut source, &mut writer, &TreeBuilderOptions::default()).unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn trailing_parent_is_rebalanced() {
        // 26 leaves with 5 children max per parent: naive chunking leaves a
        // runt parent with a single child; rebalance must give it at least
        // floor(4/2) = 2 entries (3 children).
        let chunks = chunk_children(26, 5, 2);
        assert_eq!(chunks.len(), 6);
        let last = chunks[chunks.len() - 1];
        assert!(last.1 - last.0 >= 3, "runt parent kept {} children", last.1 - last.0);
        assert_eq!(chunks.iter().map(|(s, e)| e - s).sum::<usize>(), 26);
    }
}
