//! # The Tree
//!
//! [`BinaryBTree`] opens the tree region of an index file and serves every
//! read and write against it. Reads go through a chunk-buffered
//! [`BinaryReader`]; writes go through a second handle on the same file and
//! invalidate the read buffer.
//!
//! ## Descent and Patching
//!
//! Every operation descends from the root, keeping the parsed interior
//! nodes and chosen slots on a stack. When a node relocates or splits, the
//! stack tells us exactly which 6-byte pointer field to patch: in the
//! parent, in the chain neighbors, or in the tree header when the root
//! itself moved.
//!
//! ## Growth Ladder
//!
//! An insert rewrites its leaf in place when the extent still fits,
//! relocates the leaf through the free-space tracker when it does not, and
//! splits at the median once the leaf hits the entry-count ceiling.
//! Separator inserts walk up the stack the same way: rewrite, relocate, or
//! split, until a root split claims a new root and bumps the depth. When
//! the tracker cannot satisfy a claim (the region hit its growth ceiling),
//! the operation fails with `TreeFull` and the index layer rebuilds the
//! whole tree.
//!
//! ## Search
//!
//! Range operators walk the doubly-linked leaf chain; negated operators
//! scan the whole chain and take the complement. `Undefined` keys record
//! the absence of an indexed value: they only answer `!exists`, every
//! other operator skips them.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;
use regex::Regex;

use super::builder::{build_tree, BuildStats, EntrySource, TreeBuilderOptions};
use super::freespace::{Extent, FreeSpaceTracker};
use super::header::{
    decode_tree_header, TreeState, FIELD_BYTE_LENGTH, FIELD_DEPTH, FIELD_FREE_BYTES,
    FIELD_ROOT_PTR,
};
use super::interior::{
    interior_image, interior_planned_extent, parse_interior, InteriorEntry, InteriorNode,
};
use super::leaf::{
    leaf_image, leaf_planned_extent, parse_leaf, EntryValue, Leaf, LeafEntry, LEAF_NEXT_FIELD,
    LEAF_PREV_FIELD,
};
use super::{NODE_FLAG_LEAF, NODE_PRELUDE_BYTES};
use crate::encoding::IndexKey;
use crate::error::IndexError;
use crate::io::{BinaryReader, BinaryWriter};

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub key: IndexKey,
    pub values: Vec<EntryValue>,
}

#[derive(Debug, Default)]
pub struct TreeSearchResult {
    pub entries: Vec<TreeEntry>,
}

impl TreeSearchResult {
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn value_count(&self) -> usize {
        self.entries.iter().map(|e| e.values.len()).sum()
    }
}

/// Record-pointer filter: when set, only values whose pointer bytes are in
/// the set survive the search.
#[derive(Debug, Default)]
pub struct SearchOptions {
    pub filter: Option<HashSet<Vec<u8>>>,
}

#[derive(Debug, Clone)]
pub enum TreeQuery {
    LessThan(IndexKey),
    LessOrEqual(IndexKey),
    Equal(IndexKey),
    NotEqual(IndexKey),
    GreaterThan(IndexKey),
    GreaterOrEqual(IndexKey),
    In(Vec<IndexKey>),
    NotIn(Vec<IndexKey>),
    Between(IndexKey, IndexKey),
    NotBetween(IndexKey, IndexKey),
    Like(String),
    NotLike(String),
    Matches(Regex),
    NotMatches(Regex),
    Exists,
    NotExists,
}

#[derive(Debug, Clone)]
pub enum TreeOp {
    Add {
        key: IndexKey,
        value: EntryValue,
    },
    Remove {
        key: IndexKey,
        record_pointer: Vec<u8>,
    },
    Update {
        key: IndexKey,
        old_pointer: Vec<u8>,
        value: EntryValue,
    },
}

/// A transaction that stopped early. `processed` ops were applied; the
/// caller rebuilds and re-applies the rest.
#[derive(Debug)]
pub struct FailedTransaction {
    pub processed: usize,
    pub error: eyre::Report,
}

struct DescentStep {
    node: InteriorNode,
    slot: usize,
}

enum Node {
    Leaf(Leaf),
    Interior(InteriorNode),
}

pub struct BinaryBTree {
    path: PathBuf,
    file: File,
    reader: BinaryReader,
    region_start: u64,
    state: TreeState,
    fst: FreeSpaceTracker,
}

impl BinaryBTree {
    /// Opens the tree region starting at `region_start` in `path`.
    pub fn open(path: &Path, region_start: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("opening tree file {}", path.display()))?;
        let mut reader = BinaryReader::open(path)?;

        ensure!(
            reader.len() > region_start,
            "tree region start {} beyond file length {}",
            region_start,
            reader.len()
        );
        reader.seek(region_start);
        let head = (reader.len() - region_start).min(4096) as usize;
        let head_bytes = reader.get(head)?;
        let state = decode_tree_header(&head_bytes)?;

        let growth_ceiling = (state.byte_length as u64 * 2)
            .max(state.byte_length as u64 + state.free_bytes as u64)
            .min(u32::MAX as u64);
        let fst = FreeSpaceTracker::new(
            state.byte_length as u64,
            state.free_bytes,
            growth_ceiling,
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            reader,
            region_start,
            state,
            fst,
        })
    }

    pub fn state(&self) -> &TreeState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node I/O
    // ------------------------------------------------------------------

    fn read_extent(&mut self, offset: u64) -> Result<Vec<u8>> {
        read_extent_with(&mut self.reader, self.region_start, offset)
    }

    fn read_node(&mut self, offset: u64) -> Result<Node> {
        let bytes = self.read_extent(offset)?;
        ensure!(bytes.len() >= NODE_PRELUDE_BYTES, "node extent too small");
        if bytes[4] & NODE_FLAG_LEAF != 0 {
            Ok(Node::Leaf(parse_leaf(
                &bytes,
                offset,
                self.state.unique,
                self.state.metadata_len(),
            )?))
        } else {
            Ok(Node::Interior(parse_interior(&bytes, offset)?))
        }
    }

    fn read_leaf(&mut self, offset: u64) -> Result<Leaf> {
        match self.read_node(offset)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Interior(_) => bail!("expected leaf at region offset {}", offset),
        }
    }

    fn write_bytes(&mut self, region_offset: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.region_start + region_offset))?;
        self.file.write_all(bytes)?;
        self.reader.invalidate()?;
        Ok(())
    }

    fn patch_ptr(&mut self, field_offset: u64, target: u64) -> Result<()> {
        let bytes = target.to_be_bytes();
        self.write_bytes(field_offset, &bytes[2..])
    }

    fn patch_header_u32(&mut self, field: u64, value: u32) -> Result<()> {
        self.write_bytes(field, &value.to_be_bytes())
    }

    /// Claims an extent, growing the file and patching the region bounds
    /// when the claim came from (or extended) the tail.
    fn claim(&mut self, length: u32) -> Result<Extent> {
        let (extent, grew) = self.fst.claim(length)?;
        if grew {
            self.state.byte_length = self.fst.tail_start() as u32;
            self.state.free_bytes = self.fst.tail_length();
            let needed =
                self.region_start + self.fst.tail_start() + self.fst.tail_length() as u64;
            if needed > self.file.metadata()?.len() {
                self.file.set_len(needed)?;
            }
            self.patch_header_u32(FIELD_BYTE_LENGTH, self.state.byte_length)?;
            self.patch_header_u32(FIELD_FREE_BYTES, self.state.free_bytes)?;
        }
        Ok(extent)
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    fn descend(&mut self, key: &IndexKey) -> Result<(Vec<DescentStep>, Leaf)> {
        let mut offset = self.state.root_ptr;
        let mut stack = Vec::new();
        for _ in 0..MAX_DEPTH {
            match self.read_node(offset)? {
                Node::Leaf(leaf) => return Ok((stack, leaf)),
                Node::Interior(node) => {
                    let (child, slot) = node.child_for(key);
                    stack.push(DescentStep { node, slot });
                    offset = child;
                }
            }
        }
        bail!("tree deeper than {} levels, file is corrupt", MAX_DEPTH)
    }

    fn edge_leaf(&mut self, leftmost: bool) -> Result<Leaf> {
        let mut offset = self.state.root_ptr;
        for _ in 0..MAX_DEPTH {
            match self.read_node(offset)? {
                Node::Leaf(leaf) => return Ok(leaf),
                Node::Interior(node) => {
                    offset = if leftmost {
                        node.leftmost_child()
                    } else {
                        node.rightmost_child()
                    };
                }
            }
        }
        bail!("tree deeper than {} levels, file is corrupt", MAX_DEPTH)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn find(&mut self, key: &IndexKey) -> Result<Vec<EntryValue>> {
        let (_, mut leaf) = self.descend(key)?;
        match leaf.entry_index(key) {
            Ok(i) => Ok(leaf.entries.swap_remove(i).values),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub fn search(&mut self, query: &TreeQuery, opts: &SearchOptions) -> Result<TreeSearchResult> {
        let mut result = match query {
            TreeQuery::Equal(key) => {
                let mut result = TreeSearchResult::default();
                let values = self.find(key)?;
                if !values.is_empty() {
                    result.entries.push(TreeEntry {
                        key: key.clone(),
                        values,
                    });
                }
                result
            }
            TreeQuery::In(keys) => {
                let mut sorted: Vec<&IndexKey> = keys.iter().collect();
                sorted.sort();
                sorted.dedup();
                let mut result = TreeSearchResult::default();
                for key in sorted {
                    let values = self.find(key)?;
                    if !values.is_empty() {
                        result.entries.push(TreeEntry {
                            key: key.clone(),
                            values,
                        });
                    }
                }
                result
            }
            TreeQuery::NotExists => {
                let mut result = TreeSearchResult::default();
                let values = self.find(&IndexKey::Undefined)?;
                if !values.is_empty() {
                    result.entries.push(TreeEntry {
                        key: IndexKey::Undefined,
                        values,
                    });
                }
                result
            }
            TreeQuery::LessThan(v) => {
                let v = v.clone();
                self.scan_from_start(move |k| {
                    if *k < v {
                        Verdict::Take
                    } else {
                        Verdict::Stop
                    }
                })?
            }
            TreeQuery::LessOrEqual(v) => {
                let v = v.clone();
                self.scan_from_start(move |k| {
                    if *k <= v {
                        Verdict::Take
                    } else {
                        Verdict::Stop
                    }
                })?
            }
            TreeQuery::GreaterThan(v) => {
                let from = v.clone();
                let v = v.clone();
                self.scan_from_key(&from, move |k| {
                    if *k > v {
                        Verdict::Take
                    } else {
                        Verdict::Skip
                    }
                })?
            }
            TreeQuery::GreaterOrEqual(v) => {
                let from = v.clone();
                let v = v.clone();
                self.scan_from_key(&from, move |k| {
                    if *k >= v {
                        Verdict::Take
                    } else {
                        Verdict::Skip
                    }
                })?
            }
            TreeQuery::Between(a, b) => {
                let (lo, hi) = if a <= b {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                let from = lo.clone();
                self.scan_from_key(&from, move |k| {
                    if *k < lo {
                        Verdict::Skip
                    } else if *k <= hi {
                        Verdict::Take
                    } else {
                        Verdict::Stop
                    }
                })?
            }
            TreeQuery::NotBetween(a, b) => {
                let (lo, hi) = if a <= b {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                self.scan_from_start(move |k| {
                    if *k < lo || *k > hi {
                        Verdict::Take
                    } else {
                        Verdict::Skip
                    }
                })?
            }
            TreeQuery::NotEqual(v) => {
                let v = v.clone();
                self.scan_from_start(move |k| {
                    if *k != v {
                        Verdict::Take
                    } else {
                        Verdict::Skip
                    }
                })?
            }
            TreeQuery::NotIn(keys) => {
                let mut sorted = keys.clone();
                sorted.sort();
                sorted.dedup();
                self.scan_from_start(move |k| {
                    if sorted.binary_search(k).is_err() {
                        Verdict::Take
                    } else {
                        Verdict::Skip
                    }
                })?
            }
            TreeQuery::Like(pattern) => {
                let re = glob_to_regex(pattern)?;
                let prefix = glob_literal_prefix(pattern);
                if prefix.is_empty() {
                    self.scan_from_start(move |k| match k {
                        IndexKey::String(s) if re.is_match(s) => Verdict::Take,
                        _ => Verdict::Skip,
                    })?
                } else {
                    let from = IndexKey::String(prefix.clone());
                    self.scan_from_key(&from, move |k| match k {
                        IndexKey::String(s) => {
                            if s.starts_with(&prefix) {
                                if re.is_match(s) {
                                    Verdict::Take
                                } else {
                                    Verdict::Skip
                                }
                            } else if s.as_str() > prefix.as_str() {
                                Verdict::Stop
                            } else {
                                Verdict::Skip
                            }
                        }
                        // Binaries and arrays sort after all strings.
                        IndexKey::Binary(_) | IndexKey::Array(_) => Verdict::Stop,
                        _ => Verdict::Skip,
                    })?
                }
            }
            TreeQuery::NotLike(pattern) => {
                let re = glob_to_regex(pattern)?;
                self.scan_from_start(move |k| match k {
                    IndexKey::String(s) if re.is_match(s) => Verdict::Skip,
                    _ => Verdict::Take,
                })?
            }
            TreeQuery::Matches(re) => {
                let re = re.clone();
                self.scan_from_start(move |k| match k {
                    IndexKey::String(s) if re.is_match(s) => Verdict::Take,
                    _ => Verdict::Skip,
                })?
            }
            TreeQuery::NotMatches(re) => {
                let re = re.clone();
                self.scan_from_start(move |k| match k {
                    IndexKey::String(s) if re.is_match(s) => Verdict::Skip,
                    _ => Verdict::Take,
                })?
            }
            TreeQuery::Exists => self.scan_from_start(|_| Verdict::Take)?,
        };

        if let Some(filter) = &opts.filter {
            for entry in &mut result.entries {
                entry
                    .values
                    .retain(|v| filter.contains(&v.record_pointer));
            }
            result.entries.retain(|e| !e.values.is_empty());
        }
        Ok(result)
    }

    /// Paginates values in key order. `skip` and `take` count values, not
    /// keys; values within one entry keep their stored order.
    pub fn take_entries(
        &mut self,
        skip: usize,
        take: usize,
        ascending: bool,
    ) -> Result<TreeSearchResult> {
        let mut result = TreeSearchResult::default();
        if take == 0 {
            return Ok(result);
        }
        let mut to_skip = skip;
        let mut leaf = self.edge_leaf(ascending)?;
        loop {
            let entries: Vec<&LeafEntry> = if ascending {
                leaf.entries.iter().collect()
            } else {
                leaf.entries.iter().rev().collect()
            };
            for entry in entries {
                if entry.key.is_undefined() {
                    continue;
                }
                let mut values = entry.values.clone();
                if to_skip > 0 {
                    if to_skip >= values.len() {
                        to_skip -= values.len();
                        continue;
                    }
                    values.drain(..to_skip);
                    to_skip = 0;
                }
                let taken: usize = result.value_count();
                let room = take - taken;
                values.truncate(room);
                result.entries.push(TreeEntry {
                    key: entry.key.clone(),
                    values,
                });
                if result.value_count() >= take {
                    return Ok(result);
                }
            }
            let next = if ascending { leaf.next } else { leaf.prev };
            if next == 0 {
                return Ok(result);
            }
            leaf = self.read_leaf(next)?;
        }
    }

    fn scan_from_start(
        &mut self,
        verdict: impl FnMut(&IndexKey) -> Verdict,
    ) -> Result<TreeSearchResult> {
        let leaf = self.edge_leaf(true)?;
        self.scan_chain(leaf, verdict)
    }

    fn scan_from_key(
        &mut self,
        from: &IndexKey,
        verdict: impl FnMut(&IndexKey) -> Verdict,
    ) -> Result<TreeSearchResult> {
        let (_, leaf) = self.descend(from)?;
        self.scan_chain(leaf, verdict)
    }

    fn scan_chain(
        &mut self,
        mut leaf: Leaf,
        mut verdict: impl FnMut(&IndexKey) -> Verdict,
    ) -> Result<TreeSearchResult> {
        let mut result = TreeSearchResult::default();
        loop {
            for entry in std::mem::take(&mut leaf.entries) {
                if entry.key.is_undefined() {
                    continue;
                }
                match verdict(&entry.key) {
                    Verdict::Take => result.entries.push(TreeEntry {
                        key: entry.key,
                        values: entry.values,
                    }),
                    Verdict::Skip => {}
                    Verdict::Stop => return Ok(result),
                }
            }
            if leaf.next == 0 {
                return Ok(result);
            }
            leaf = self.read_leaf(leaf.next)?;
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn add(&mut self, key: &IndexKey, value: EntryValue) -> Result<()> {
        let (stack, mut leaf) = self.descend(key)?;
        match leaf.entry_index(key) {
            Ok(i) => {
                if self.state.unique {
                    return Err(IndexError::DuplicateKey.into());
                }
                let entry = &mut leaf.entries[i];
                match entry
                    .values
                    .iter_mut()
                    .find(|v| v.record_pointer == value.record_pointer)
                {
                    Some(existing) => existing.metadata = value.metadata,
                    None => entry.values.push(value),
                }
                self.store_leaf(leaf, &stack)?;
            }
            Err(pos) => {
                if leaf.entries.len() >= self.state.entries_per_node as usize {
                    self.split_leaf(leaf, stack, pos, key.clone(), value)?;
                } else {
                    leaf.entries.insert(
                        pos,
                        LeafEntry {
                            key: key.clone(),
                            values: vec![value],
                        },
                    );
                    self.store_leaf(leaf, &stack)?;
                }
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &IndexKey, record_pointer: &[u8]) -> Result<()> {
        let (stack, mut leaf) = self.descend(key)?;
        let Ok(i) = leaf.entry_index(key) else {
            return Ok(());
        };
        leaf.entries[i]
            .values
            .retain(|v| v.record_pointer != record_pointer);
        if leaf.entries[i].values.is_empty() {
            // Emptied entries go away; an emptied leaf stays chained as a
            // tombstone, since parent routing still descends into it. The
            // next rebuild reclaims it.
            leaf.entries.remove(i);
        }
        self.store_leaf(leaf, &stack)?;
        Ok(())
    }

    pub fn update(&mut self, key: &IndexKey, old_pointer: &[u8], value: EntryValue) -> Result<()> {
        let (stack, mut leaf) = self.descend(key)?;
        match leaf.entry_index(key) {
            Ok(i) => {
                let entry = &mut leaf.entries[i];
                entry.values.retain(|v| v.record_pointer != old_pointer);
                entry
                    .values
                    .retain(|v| v.record_pointer != value.record_pointer);
                entry.values.push(value);
                self.store_leaf(leaf, &stack)?;
                Ok(())
            }
            Err(_) => {
                drop(stack);
                self.add(key, value)
            }
        }
    }

    /// Applies a batch of ops in order. On the first failure the batch
    /// stops; the caller decides whether to rebuild and re-apply.
    pub fn transaction(&mut self, ops: &[TreeOp]) -> std::result::Result<(), FailedTransaction> {
        for (i, op) in ops.iter().enumerate() {
            let outcome = match op {
                TreeOp::Add { key, value } => self.add(key, value.clone()),
                TreeOp::Remove {
                    key,
                    record_pointer,
                } => self.remove(key, record_pointer),
                TreeOp::Update {
                    key,
                    old_pointer,
                    value,
                } => self.update(key, old_pointer, value.clone()),
            };
            if let Err(error) = outcome {
                return Err(FailedTransaction {
                    processed: i,
                    error,
                });
            }
        }
        Ok(())
    }

    /// Streams every live entry, in key order, through the bulk builder
    /// into `writer`. The caller swaps files and reopens.
    pub fn rebuild(
        &mut self,
        writer: &mut dyn BinaryWriter,
        opts: &TreeBuilderOptions,
    ) -> Result<BuildStats> {
        let first_leaf = self.edge_leaf(true)?.offset;
        let mut source = ChainSource::open(
            &self.path,
            self.region_start,
            first_leaf,
            self.state.unique,
            self.state.metadata_len(),
        )?;
        build_tree(&mut source, writer, opts)
    }

    fn store_leaf(&mut self, leaf: Leaf, stack: &[DescentStep]) -> Result<u64> {
        let unique = self.state.unique;
        let metadata_len = self.state.metadata_len();
        if let Ok(image) = leaf_image(&leaf, unique, metadata_len, leaf.extent) {
            self.write_bytes(leaf.offset, &image)?;
            return Ok(leaf.offset);
        }
        self.relocate_leaf(leaf, stack)
    }

    fn relocate_leaf(&mut self, mut leaf: Leaf, stack: &[DescentStep]) -> Result<u64> {
        let unique = self.state.unique;
        let metadata_len = self.state.metadata_len();
        let wanted = leaf_planned_extent(&leaf.entries, unique, metadata_len)?;
        let extent = self.claim(wanted)?;

        let old = Extent {
            offset: leaf.offset,
            length: leaf.extent,
        };
        leaf.offset = extent.offset;
        leaf.extent = extent.length;
        let image = leaf_image(&leaf, unique, metadata_len, leaf.extent)?;
        self.write_bytes(leaf.offset, &image)?;

        self.patch_parent(stack, leaf.offset)?;
        if leaf.prev != 0 {
            self.patch_ptr(leaf.prev + LEAF_NEXT_FIELD, leaf.offset)?;
        }
        if leaf.next != 0 {
            self.patch_ptr(leaf.next + LEAF_PREV_FIELD, leaf.offset)?;
        }
        self.fst.release(old);
        Ok(leaf.offset)
    }

    /// Points the parent slot (or the root pointer) at a relocated child.
    fn patch_parent(&mut self, stack: &[DescentStep], new_child: u64) -> Result<()> {
        match stack.last() {
            Some(step) => {
                let field = step.node.child_field(step.slot);
                self.patch_ptr(field, new_child)
            }
            None => {
                self.state.root_ptr = new_child;
                let bytes = new_child.to_be_bytes();
                self.write_bytes(FIELD_ROOT_PTR, &bytes[2..])
            }
        }
    }

    fn split_leaf(
        &mut self,
        mut leaf: Leaf,
        mut stack: Vec<DescentStep>,
        pos: usize,
        key: IndexKey,
        value: EntryValue,
    ) -> Result<()> {
        let unique = self.state.unique;
        let metadata_len = self.state.metadata_len();
        leaf.entries.insert(
            pos,
            LeafEntry {
                key,
                values: vec![value],
            },
        );
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let separator = right_entries[0].key.clone();

        let right_extent = self.claim(leaf_planned_extent(&right_entries, unique, metadata_len)?)?;
        let old_next = leaf.next;
        let right = Leaf {
            offset: right_extent.offset,
            extent: right_extent.length,
            prev: leaf.offset,
            next: old_next,
            entries: right_entries,
        };
        let right_image = leaf_image(&right, unique, metadata_len, right.extent)?;
        self.write_bytes(right.offset, &right_image)?;

        leaf.next = right.offset;
        let left_offset = self.store_leaf(leaf, &stack)?;
        // store_leaf fixed right.prev if the left half relocated.
        if old_next != 0 {
            self.patch_ptr(old_next + LEAF_PREV_FIELD, right.offset)?;
        }

        let parent = stack.pop();
        self.insert_separator(parent, stack, separator, left_offset, right.offset)
    }

    fn insert_separator(
        &mut self,
        parent: Option<DescentStep>,
        stack: Vec<DescentStep>,
        separator: IndexKey,
        left: u64,
        right: u64,
    ) -> Result<()> {
        let Some(step) = parent else {
            // Root split: a fresh root routes the two halves.
            let entries = vec![InteriorEntry {
                key: separator,
                lt_child: left,
            }];
            let extent = self.claim(interior_planned_extent(&entries))?;
            let image = interior_image(&entries, right, extent.length)?;
            self.write_bytes(extent.offset, &image)?;
            self.state.root_ptr = extent.offset;
            self.state.depth += 1;
            let bytes = extent.offset.to_be_bytes();
            self.write_bytes(FIELD_ROOT_PTR, &bytes[2..])?;
            self.write_bytes(FIELD_DEPTH, &[self.state.depth])?;
            return Ok(());
        };

        let mut node = step.node;
        let slot = step.slot;
        node.entries.insert(
            slot,
            InteriorEntry {
                key: separator,
                lt_child: left,
            },
        );
        if slot + 1 < node.entries.len() {
            node.entries[slot + 1].lt_child = right;
        } else {
            node.gt_child = right;
        }

        if node.entries.len() > self.state.entries_per_node as usize {
            self.split_interior(node, stack)
        } else {
            self.store_interior(node, &stack)?;
            Ok(())
        }
    }

    fn store_interior(&mut self, node: InteriorNode, stack: &[DescentStep]) -> Result<u64> {
        if let Ok(image) = interior_image(&node.entries, node.gt_child, node.extent) {
            self.write_bytes(node.offset, &image)?;
            return Ok(node.offset);
        }
        let extent = self.claim(interior_planned_extent(&node.entries))?;
        let image = interior_image(&node.entries, node.gt_child, extent.length)?;
        self.write_bytes(extent.offset, &image)?;
        self.patch_parent(stack, extent.offset)?;
        self.fst.release(Extent {
            offset: node.offset,
            length: node.extent,
        });
        Ok(extent.offset)
    }

    fn split_interior(
        &mut self,
        mut node: InteriorNode,
        mut stack: Vec<DescentStep>,
    ) -> Result<()> {
        let mid = node.entries.len() / 2;
        let right_entries = node.entries.split_off(mid + 1);
        let median = node.entries.pop().expect("split_interior on empty node");
        let promoted = median.key;

        let right_gt = node.gt_child;
        node.gt_child = median.lt_child;

        let right_extent = self.claim(interior_planned_extent(&right_entries))?;
        let right_image = interior_image(&right_entries, right_gt, right_extent.length)?;
        self.write_bytes(right_extent.offset, &right_image)?;

        let left_offset = self.store_interior(node, &stack)?;
        let parent = stack.pop();
        self.insert_separator(parent, stack, promoted, left_offset, right_extent.offset)
    }
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Take,
    Skip,
    Stop,
}

fn read_extent_with(reader: &mut BinaryReader, region_start: u64, offset: u64) -> Result<Vec<u8>> {
    reader.seek(region_start + offset);
    let len = reader.get_u32()?;
    ensure!(len as usize >= NODE_PRELUDE_BYTES, "node extent too small");
    reader.seek(region_start + offset);
    reader.get(len as usize)
}

/// Translates a glob pattern (`*` any run, `?` one char) into an anchored
/// regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).wrap_err_with(|| format!("invalid like pattern {:?}", pattern))
}

/// Literal prefix of a glob pattern, up to the first wildcard.
pub fn glob_literal_prefix(pattern: &str) -> String {
    pattern
        .chars()
        .take_while(|c| *c != '*' && *c != '?')
        .collect()
}

/// Rewindable stream over the live entries of an existing tree, used by
/// rebuilds. Reads through its own file handle so the builder can write
/// elsewhere concurrently.
struct ChainSource {
    reader: BinaryReader,
    region_start: u64,
    first_leaf: u64,
    unique: bool,
    metadata_len: usize,
    pending: std::vec::IntoIter<LeafEntry>,
    next_leaf: u64,
}

impl ChainSource {
    fn open(
        path: &Path,
        region_start: u64,
        first_leaf: u64,
        unique: bool,
        metadata_len: usize,
    ) -> Result<Self> {
        Ok(Self {
            reader: BinaryReader::open(path)?,
            region_start,
            first_leaf,
            unique,
            metadata_len,
            pending: Vec::new().into_iter(),
            next_leaf: first_leaf,
        })
    }
}

impl EntrySource for ChainSource {
    fn next_entry(&mut self) -> Result<Option<LeafEntry>> {
        loop {
            if let Some(entry) = self.pending.next() {
                return Ok(Some(entry));
            }
            if self.next_leaf == 0 {
                return Ok(None);
            }
            let bytes = read_extent_with(&mut self.reader, self.region_start, self.next_leaf)?;
            let leaf = parse_leaf(&bytes, self.next_leaf, self.unique, self.metadata_len)?;
            self.next_leaf = leaf.next;
            self.pending = leaf.entries.into_iter();
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.pending = Vec::new().into_iter();
        self.next_leaf = self.first_leaf;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::builder::{TreeBuilderOptions, VecEntrySource};
    use crate::io::FileWriter;
    use tempfile::tempdir;

    fn value(rp: &str) -> EntryValue {
        EntryValue {
            record_pointer: rp.as_bytes().to_vec(),
            metadata: Vec::new(),
        }
    }

    fn entry(key: i64, rp: &str) -> LeafEntry {
        LeafEntry {
            key: IndexKey::Integer(key),
            values: vec![value(rp)],
        }
    }

    fn build_file(
        dir: &tempfile::TempDir,
        entries: Vec<LeafEntry>,
        opts: &TreeBuilderOptions,
    ) -> std::path::PathBuf {
        let path = dir.path().join("tree.idx");
        let mut writer = FileWriter::create(&path).unwrap();
        let mut source = VecEntrySource::new(entries);
        build_tree(&mut source, &mut writer, opts).unwrap();
        writer.sync().unwrap();
        path
    }

    fn small_opts() -> TreeBuilderOptions {
        TreeBuilderOptions {
            entries_per_node: 4,
            fill_factor: 100,
            ..Default::default()
        }
    }

    #[test]
    fn find_across_multiple_levels() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..200).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());

        let mut tree = BinaryBTree::open(&path, 0).unwrap();
        assert!(tree.state().depth > 2);

        for probe in [0i64, 57, 123, 199] {
            let values = tree.find(&IndexKey::Integer(probe)).unwrap();
            assert_eq!(values.len(), 1, "key {} missing", probe);
            assert_eq!(values[0].record_pointer, format!("r{}", probe).into_bytes());
        }
        assert!(tree.find(&IndexKey::Integer(500)).unwrap().is_empty());
    }

    #[test]
    fn range_search_walks_leaf_chain() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..100).map(|i| entry(i * 2, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let result = tree
            .search(
                &TreeQuery::Between(IndexKey::Integer(50), IndexKey::Integer(60)),
                &SearchOptions::default(),
            )
            .unwrap();
        let keys: Vec<&IndexKey> = result.entries.iter().map(|e| &e.key).collect();
        assert_eq!(
            keys,
            [50, 52, 54, 56, 58, 60]
                .iter()
                .map(|i| IndexKey::Integer(*i))
                .collect::<Vec<_>>()
                .iter()
                .collect::<Vec<_>>()
        );

        let ge = tree
            .search(
                &TreeQuery::GreaterOrEqual(IndexKey::Integer(190)),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(ge.key_count(), 5);

        let lt = tree
            .search(
                &TreeQuery::LessThan(IndexKey::Integer(10)),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(lt.key_count(), 5);
    }

    #[test]
    fn negated_search_takes_complement() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..20).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let ne = tree
            .search(
                &TreeQuery::NotEqual(IndexKey::Integer(7)),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(ne.key_count(), 19);

        let nin = tree
            .search(
                &TreeQuery::NotIn(vec![IndexKey::Integer(1), IndexKey::Integer(2)]),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(nin.key_count(), 18);
    }

    #[test]
    fn like_search_uses_prefix_range() {
        let dir = tempdir().unwrap();
        let names = [
            "alice", "alan", "albert", "bob", "bonnie", "carol", "carla", "dave",
        ];
        let entries: Vec<LeafEntry> = {
            let mut sorted = names.to_vec();
            sorted.sort();
            sorted
                .iter()
                .map(|n| LeafEntry {
                    key: IndexKey::String((*n).to_string()),
                    values: vec![value(n)],
                })
                .collect()
        };
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let result = tree
            .search(&TreeQuery::Like("al*".into()), &SearchOptions::default())
            .unwrap();
        assert_eq!(result.key_count(), 3);

        let result = tree
            .search(&TreeQuery::Like("car?l".into()), &SearchOptions::default())
            .unwrap();
        assert_eq!(result.key_count(), 1);

        let result = tree
            .search(&TreeQuery::NotLike("al*".into()), &SearchOptions::default())
            .unwrap();
        assert_eq!(result.key_count(), 5);
    }

    #[test]
    fn filter_intersects_by_record_pointer() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..10).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let mut filter = HashSet::new();
        filter.insert(b"r3".to_vec());
        filter.insert(b"r7".to_vec());
        let result = tree
            .search(
                &TreeQuery::GreaterOrEqual(IndexKey::Integer(0)),
                &SearchOptions {
                    filter: Some(filter),
                },
            )
            .unwrap();
        assert_eq!(result.value_count(), 2);
    }

    #[test]
    fn add_in_place_and_duplicate_pointer_updates_metadata() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..4).map(|i| entry(i * 10, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        tree.add(&IndexKey::Integer(5), value("new")).unwrap();
        assert_eq!(tree.find(&IndexKey::Integer(5)).unwrap().len(), 1);

        // Same key, second pointer.
        tree.add(&IndexKey::Integer(5), value("other")).unwrap();
        assert_eq!(tree.find(&IndexKey::Integer(5)).unwrap().len(), 2);

        // Same pointer again merely replaces metadata.
        tree.add(&IndexKey::Integer(5), value("other")).unwrap();
        assert_eq!(tree.find(&IndexKey::Integer(5)).unwrap().len(), 2);
    }

    #[test]
    fn inserts_split_leaves_and_grow_a_new_root() {
        let dir = tempdir().unwrap();
        let path = build_file(&dir, vec![entry(0, "r0")], &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();
        assert_eq!(tree.state().depth, 1);

        for i in 1..100 {
            tree.add(&IndexKey::Integer(i), value(&format!("r{}", i)))
                .unwrap();
        }
        assert!(tree.state().depth > 1, "root never split");

        for i in 0..100 {
            assert_eq!(
                tree.find(&IndexKey::Integer(i)).unwrap().len(),
                1,
                "key {} lost after splits",
                i
            );
        }

        // The chain must stay sorted and complete.
        let all = tree
            .search(
                &TreeQuery::GreaterOrEqual(IndexKey::Integer(0)),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(all.key_count(), 100);
        let keys: Vec<i64> = all
            .entries
            .iter()
            .map(|e| match &e.key {
                IndexKey::Integer(i) => *i,
                other => panic!("unexpected key {}", other),
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn reverse_inserts_keep_order() {
        let dir = tempdir().unwrap();
        let path = build_file(&dir, vec![entry(1000, "seed")], &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        for i in (0..200).rev() {
            tree.add(&IndexKey::Integer(i), value(&format!("r{}", i)))
                .unwrap();
        }
        let all = tree
            .search(
                &TreeQuery::GreaterOrEqual(IndexKey::Integer(0)),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(all.key_count(), 201);
    }

    #[test]
    fn remove_empties_entry_then_leaf() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..40).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        for i in 0..40 {
            tree.remove(&IndexKey::Integer(i), format!("r{}", i).as_bytes())
                .unwrap();
        }
        let all = tree
            .search(&TreeQuery::Exists, &SearchOptions::default())
            .unwrap();
        assert_eq!(all.key_count(), 0);

        // Removing a missing key is a no-op.
        tree.remove(&IndexKey::Integer(7), b"r7").unwrap();
    }

    #[test]
    fn update_swaps_record_pointer() {
        let dir = tempdir().unwrap();
        let path = build_file(&dir, vec![entry(1, "old")], &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        tree.update(&IndexKey::Integer(1), b"old", value("new"))
            .unwrap();
        let values = tree.find(&IndexKey::Integer(1)).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].record_pointer, b"new");
    }

    #[test]
    fn take_paginates_in_both_directions() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..30).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let asc = tree.take_entries(5, 3, true).unwrap();
        let keys: Vec<&IndexKey> = asc.entries.iter().map(|e| &e.key).collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(*keys[0], IndexKey::Integer(5));
        assert_eq!(*keys[2], IndexKey::Integer(7));

        let desc = tree.take_entries(0, 2, false).unwrap();
        let keys: Vec<&IndexKey> = desc.entries.iter().map(|e| &e.key).collect();
        assert_eq!(*keys[0], IndexKey::Integer(29));
        assert_eq!(*keys[1], IndexKey::Integer(28));
    }

    #[test]
    fn growth_ceiling_raises_tree_full() {
        let dir = tempdir().unwrap();
        let opts = TreeBuilderOptions {
            entries_per_node: 4,
            fill_factor: 100,
            reserved_free: 0,
            ..Default::default()
        };
        let seed: Vec<LeafEntry> = (0..10).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, seed, &opts);
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let mut failed = None;
        for i in 10..100_000 {
            if let Err(err) = tree.add(&IndexKey::Integer(i), value(&format!("r{}", i))) {
                failed = Some(err);
                break;
            }
        }
        let err = failed.expect("tiny tree should hit its growth ceiling");
        assert!(IndexError::is_tree_full(&err));
    }

    #[test]
    fn rebuild_preserves_content_and_compacts() {
        let dir = tempdir().unwrap();
        let entries: Vec<LeafEntry> = (0..100).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, entries, &small_opts());
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        for i in 0..50 {
            tree.remove(&IndexKey::Integer(i * 2), format!("r{}", i * 2).as_bytes())
                .unwrap();
        }
        tree.add(&IndexKey::Integer(1000), value("extra")).unwrap();

        let rebuilt_path = dir.path().join("rebuilt.idx");
        let mut writer = FileWriter::create(&rebuilt_path).unwrap();
        let rebuild_opts = TreeBuilderOptions {
            entries_per_node: 4,
            fill_factor: 50,
            ..Default::default()
        };
        let stats = tree.rebuild(&mut writer, &rebuild_opts).unwrap();
        writer.sync().unwrap();
        assert_eq!(stats.entry_count, 51);

        let mut rebuilt = BinaryBTree::open(&rebuilt_path, 0).unwrap();
        for i in 0..50 {
            assert!(rebuilt
                .find(&IndexKey::Integer(i * 2 + 1))
                .unwrap()
                .len()
                == 1);
            assert!(rebuilt.find(&IndexKey::Integer(i * 2)).unwrap().is_empty());
        }
        assert_eq!(rebuilt.find(&IndexKey::Integer(1000)).unwrap().len(), 1);
    }

    #[test]
    fn transaction_reports_failure_position() {
        let dir = tempdir().unwrap();
        let opts = TreeBuilderOptions {
            entries_per_node: 4,
            fill_factor: 100,
            reserved_free: 0,
            ..Default::default()
        };
        let seed: Vec<LeafEntry> = (0..10).map(|i| entry(i, &format!("r{}", i))).collect();
        let path = build_file(&dir, seed, &opts);
        let mut tree = BinaryBTree::open(&path, 0).unwrap();

        let ops: Vec<TreeOp> = (10..100_000)
            .map(|i| TreeOp::Add {
                key: IndexKey::Integer(i),
                value: value(&format!("r{}", i)),
            })
            .collect();
        let failed = tree.transaction(&ops).unwrap_err();
        assert!(IndexError::is_tree_full(&failed.error));
        assert!(failed.processed > 0);
    }

    #[test]
    fn glob_prefix_extraction() {
        assert_eq!(glob_literal_prefix("al*"), "al");
        assert_eq!(glob_literal_prefix("*al"), "");
        assert_eq!(glob_literal_prefix("a?c"), "a");
        assert_eq!(glob_literal_prefix("plain"), "plain");
    }
}
