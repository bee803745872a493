//! # Index Layer
//!
//! One [`DataIndex`] wraps one index file: the envelope header, the tree,
//! a query cache and the per-index reader/writer lock. The four index
//! types share all of that machinery and differ only in their
//! [`IndexStrategy`]: how a record projects to `(key, record pointer,
//! metadata)` tree entries, which operators they accept, and how a query
//! translates to tree searches.
//!
//! ```text
//! DataIndex
//! ├── IndexDefinition     path, key, include, cs, locale, type
//! ├── IndexLock           FIFO readers/writer queue
//! ├── QueryCache          (op, value) -> results, TTL, cleared on write
//! ├── BinaryBTree         exclusive open handle on the index file
//! └── IndexStrategy       normal | array | fulltext | geo
//! ```
//!
//! ## Update Path
//!
//! A change event projects the old and new record values through the
//! strategy; set-diffing the projections yields remove ops (keys that
//! vanished) and add ops (entries that appeared or changed metadata),
//! removes first. The batch applies under the write lock; a `TreeFull`
//! failure triggers a full rebuild, after which the remaining ops are
//! re-applied. The cache clears before the lock releases.
//!
//! ## Query Path
//!
//! Operator validation, cache probe, then a shared-lock tree search
//! through the strategy, and decoding of record pointers back to absolute
//! paths. Filtered queries (intersection with a prior result set) bypass
//! the cache.

pub mod array;
pub mod cache;
pub mod fulltext;
pub mod geo;
pub mod header;
pub mod lock;
pub mod normal;
pub mod query;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::debug;

use crate::btree::tree::FailedTransaction;
use crate::btree::{
    BinaryBTree, EntryValue, TreeBuilderOptions, TreeOp, TreeQuery, TreeSearchResult,
};
use crate::config::{MAX_ENTRIES_PER_NODE, REBUILD_FILL_FACTOR, TREE_RESERVED_FREE};
use crate::encoding::{IndexKey, RecordPointer};
use crate::error::IndexError;
use crate::io::{BinaryWriter, FileWriter};
use crate::path::PathInfo;
use crate::store::{NodeStore, NodeValue};

pub use cache::QueryCache;
pub use header::{read_envelope, EnvelopeInfo};
pub use lock::IndexLock;
pub use query::{IndexQueryResult, IndexQueryResults, QueryValue};

/// Definition sentinel meaning "index the child's own key".
pub const KEY_SENTINEL: &str = "{key}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Normal,
    Array,
    FullText,
    Geo,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Normal => "normal",
            IndexType::Array => "array",
            IndexType::FullText => "fulltext",
            IndexType::Geo => "geo",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(IndexType::Normal),
            "array" => Ok(IndexType::Array),
            "fulltext" => Ok(IndexType::FullText),
            "geo" => Ok(IndexType::Geo),
            other => {
                Err(IndexError::UnsupportedFormat(format!("unknown index type {:?}", other)).into())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub path: PathInfo,
    pub key: String,
    pub include_keys: Vec<String>,
    pub case_sensitive: bool,
    pub locale: String,
    pub index_type: IndexType,
}

impl IndexDefinition {
    pub fn indexes_child_key(&self) -> bool {
        self.key == KEY_SENTINEL
    }

    /// Folds string keys for case-insensitive indexes. The locale is
    /// carried for callers that fold externally; folding here uses
    /// Unicode lowercasing.
    pub fn normalize(&self, key: IndexKey) -> IndexKey {
        if self.case_sensitive {
            key
        } else {
            key.fold_case()
        }
    }

    /// Metadata keys stored with every tree value: the configured include
    /// keys plus the strategy's own (e.g. `_occurs_`).
    pub fn metadata_keys(&self) -> Vec<String> {
        let mut keys = self.include_keys.clone();
        keys.extend(
            strategy_for(self.index_type)
                .extra_metadata_keys()
                .iter()
                .map(|k| k.to_string()),
        );
        keys
    }

    /// File name of this index inside the storage directory, e.g.
    /// `users-#-posts-date.idx` for `users/*/posts` on `date`.
    pub fn file_name(&self) -> String {
        let base = self.path.source().replace('/', "-").replace('*', "#");
        match self.index_type {
            IndexType::Normal => format!("{}-{}.idx", base, self.key),
            other => format!("{}-{}.{}.idx", base, self.key, other.as_str()),
        }
    }

    pub fn description(&self) -> String {
        format!(
            "{} index on \"{}\"({})",
            self.index_type.as_str(),
            self.path.source(),
            self.key
        )
    }
}

/// One projected tree entry for a record: the entry key and the
/// strategy-specific metadata tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedEntry {
    pub key: IndexKey,
    pub extra: Vec<IndexKey>,
}

/// The capabilities an index type plugs into the shared machinery.
pub(crate) trait IndexStrategy: Sync {
    fn index_type(&self) -> IndexType;

    /// Metadata keys this strategy appends after the include keys.
    fn extra_metadata_keys(&self) -> &'static [&'static str];

    fn valid_operators(&self) -> &'static [&'static str];

    /// Projects a record value to its tree entries.
    fn project(
        &self,
        def: &IndexDefinition,
        child_key: &str,
        value: &NodeValue,
    ) -> Result<Vec<ProjectedEntry>>;

    /// Runs one operator against the tree.
    fn query(
        &self,
        def: &IndexDefinition,
        tree: &mut BinaryBTree,
        op: &str,
        value: &QueryValue,
        filter: Option<HashSet<Vec<u8>>>,
    ) -> Result<TreeSearchResult>;
}

pub(crate) fn strategy_for(index_type: IndexType) -> &'static dyn IndexStrategy {
    match index_type {
        IndexType::Normal => &normal::NormalIndex,
        IndexType::Array => &array::ArrayIndex,
        IndexType::FullText => &fulltext::FullTextIndex,
        IndexType::Geo => &geo::GeoIndex,
    }
}

/// Projects a record value to its full `(key, metadata)` tree entries:
/// the strategy's entries with the include-key values prepended to each
/// metadata tuple. Shared by incremental updates and the build pipeline.
pub(crate) fn project_record(
    def: &IndexDefinition,
    child_key: &str,
    value: &NodeValue,
) -> Result<Vec<(IndexKey, Vec<IndexKey>)>> {
    let strategy = strategy_for(def.index_type);
    let entries = strategy.project(def, child_key, value)?;
    let include: Vec<IndexKey> = def
        .include_keys
        .iter()
        .map(|k| {
            value
                .get(k)
                .map(NodeValue::to_key)
                .unwrap_or(IndexKey::Undefined)
        })
        .collect();
    Ok(entries
        .into_iter()
        .map(|e| {
            let mut metadata = include.clone();
            metadata.extend(e.extra);
            (e.key, metadata)
        })
        .collect())
}

pub(crate) fn scalar_operand(op: &str, value: &QueryValue) -> Result<IndexKey> {
    match value {
        QueryValue::Key(key) => Ok(key.clone()),
        other => Err(IndexError::InvalidArgument(format!(
            "operator {:?} expects a scalar value, got {:?}",
            op, other
        ))
        .into()),
    }
}

/// Maps a scalar operator and operand onto a tree query, normalizing
/// string operands the same way stored keys were normalized.
pub(crate) fn scalar_tree_query(
    def: &IndexDefinition,
    op: &str,
    value: &QueryValue,
) -> Result<TreeQuery> {
    let query = match op {
        "<" => TreeQuery::LessThan(def.normalize(scalar_operand(op, value)?)),
        "<=" => TreeQuery::LessOrEqual(def.normalize(scalar_operand(op, value)?)),
        "==" => TreeQuery::Equal(def.normalize(scalar_operand(op, value)?)),
        "!=" => TreeQuery::NotEqual(def.normalize(scalar_operand(op, value)?)),
        ">" => TreeQuery::GreaterThan(def.normalize(scalar_operand(op, value)?)),
        ">=" => TreeQuery::GreaterOrEqual(def.normalize(scalar_operand(op, value)?)),
        "in" | "!in" => {
            let QueryValue::Keys(keys) = value else {
                return Err(IndexError::InvalidArgument(format!(
                    "operator {:?} expects a list of values",
                    op
                ))
                .into());
            };
            let keys: Vec<IndexKey> = keys.iter().cloned().map(|k| def.normalize(k)).collect();
            if op == "in" {
                TreeQuery::In(keys)
            } else {
                TreeQuery::NotIn(keys)
            }
        }
        "between" | "!between" => {
            let QueryValue::Range(a, b) = value else {
                return Err(IndexError::InvalidArgument(format!(
                    "operator {:?} expects a [low, high] range",
                    op
                ))
                .into());
            };
            let (a, b) = (def.normalize(a.clone()), def.normalize(b.clone()));
            if op == "between" {
                TreeQuery::Between(a, b)
            } else {
                TreeQuery::NotBetween(a, b)
            }
        }
        "like" | "!like" => {
            let QueryValue::Text(pattern) = value else {
                return Err(IndexError::InvalidArgument(format!(
                    "operator {:?} expects a pattern",
                    op
                ))
                .into());
            };
            let pattern = if def.case_sensitive {
                pattern.clone()
            } else {
                pattern.to_lowercase()
            };
            if op == "like" {
                TreeQuery::Like(pattern)
            } else {
                TreeQuery::NotLike(pattern)
            }
        }
        "matches" | "!matches" => {
            let QueryValue::Text(pattern) = value else {
                return Err(IndexError::InvalidArgument(format!(
                    "operator {:?} expects a regular expression",
                    op
                ))
                .into());
            };
            let re = regex::Regex::new(pattern).map_err(|e| {
                IndexError::InvalidArgument(format!("invalid regex {:?}: {}", pattern, e))
            })?;
            if op == "matches" {
                TreeQuery::Matches(re)
            } else {
                TreeQuery::NotMatches(re)
            }
        }
        "exists" => TreeQuery::Exists,
        "!exists" => TreeQuery::NotExists,
        other => {
            return Err(IndexError::InvalidArgument(format!(
                "unknown operator {:?} for {}",
                other,
                def.description()
            ))
            .into())
        }
    };
    Ok(query)
}

/// A persisted index instance over one index file.
pub struct DataIndex {
    def: IndexDefinition,
    file_path: PathBuf,
    lock: IndexLock,
    cache: QueryCache,
    tree: Mutex<Option<BinaryBTree>>,
}

impl DataIndex {
    pub fn new(storage_dir: &Path, def: IndexDefinition) -> Self {
        let file_path = storage_dir.join(def.file_name());
        Self {
            def,
            file_path,
            lock: IndexLock::new(),
            cache: QueryCache::default(),
            tree: Mutex::new(None),
        }
    }

    /// Opens an existing index file, taking the definition from its
    /// envelope.
    pub fn open_file(path: &Path) -> Result<Self> {
        let envelope = header::read_envelope(path)?;
        Ok(Self {
            def: envelope.def,
            file_path: path.to_path_buf(),
            lock: IndexLock::new(),
            cache: QueryCache::default(),
            tree: Mutex::new(None),
        })
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.def
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn exists(&self) -> bool {
        self.file_path.exists()
    }

    fn with_tree<R>(&self, f: impl FnOnce(&mut BinaryBTree) -> Result<R>) -> Result<R> {
        let mut guard = self.tree.lock();
        if guard.is_none() {
            let envelope = header::read_envelope(&self.file_path).wrap_err_with(|| {
                format!("opening {} for {}", self.file_path.display(), self.def.description())
            })?;
            *guard = Some(BinaryBTree::open(
                &self.file_path,
                envelope.header_length as u64,
            )?);
        }
        f(guard.as_mut().expect("tree opened above"))
    }

    /// Builds the index from scratch through the external-sort pipeline.
    pub fn build(&self, store: &dyn NodeStore) -> Result<()> {
        let _guard = self.lock.write();
        *self.tree.lock() = None;
        crate::build::build_index(store, &self.def, &self.file_path)?;
        self.cache.clear();
        debug!(index = %self.def.description(), "index built");
        Ok(())
    }

    /// Rebuilds the tree from its own live entries, compacting the file.
    pub fn rebuild(&self) -> Result<()> {
        let _guard = self.lock.write();
        self.rebuild_locked()?;
        self.cache.clear();
        Ok(())
    }

    fn rebuild_locked(&self) -> Result<()> {
        let tmp_path = crate::build::tmp_path(&self.file_path);
        {
            let mut guard = self.tree.lock();
            if guard.is_none() {
                let envelope = header::read_envelope(&self.file_path)?;
                *guard = Some(BinaryBTree::open(
                    &self.file_path,
                    envelope.header_length as u64,
                )?);
            }
            let tree = guard.as_mut().expect("tree opened above");

            let mut writer = FileWriter::create(&tmp_path)?;
            let layout = header::write_envelope(&mut writer, &self.def)?;
            let opts = TreeBuilderOptions {
                entries_per_node: MAX_ENTRIES_PER_NODE,
                fill_factor: REBUILD_FILL_FACTOR,
                unique: false,
                metadata_keys: self.def.metadata_keys(),
                reserved_free: TREE_RESERVED_FREE,
            };
            let stats = tree.rebuild(&mut writer, &opts)?;
            header::patch_envelope(
                &mut writer,
                &layout,
                stats.byte_length,
                stats.entry_count,
                stats.value_count,
            )?;
            writer.sync()?;

            // Swap under the closed handle.
            *guard = None;
            std::fs::rename(&tmp_path, &self.file_path).wrap_err_with(|| {
                format!("committing rebuilt index {}", self.file_path.display())
            })?;
            debug!(
                index = %self.def.description(),
                entries = stats.entry_count,
                values = stats.value_count,
                "tree rebuilt"
            );
        }
        self.cache.clear();
        Ok(())
    }

    fn project_full(
        &self,
        child_key: &str,
        value: Option<&NodeValue>,
    ) -> Result<Vec<(IndexKey, Vec<IndexKey>)>> {
        match value {
            Some(value) => project_record(&self.def, child_key, value),
            None => Ok(Vec::new()),
        }
    }

    /// Applies a primary-store change event to the index. `old`/`new` are
    /// the record's value before and after; `None` means absent.
    pub fn handle_record_update(
        &self,
        path: &str,
        old: Option<&NodeValue>,
        new: Option<&NodeValue>,
    ) -> Result<()> {
        let Some((wildcards, child_key)) = self.def.path.match_record_path(path) else {
            return Ok(());
        };
        let record_pointer = RecordPointer::new(wildcards, child_key.clone()).encode()?;

        let old_entries = self.project_full(&child_key, old)?;
        let new_entries = self.project_full(&child_key, new)?;

        // Removes first, then adds; adds on an existing (key, pointer)
        // pair replace the stored metadata.
        let mut ops: Vec<TreeOp> = Vec::new();
        for (key, _) in &old_entries {
            if !new_entries.iter().any(|(k, _)| k == key) {
                ops.push(TreeOp::Remove {
                    key: key.clone(),
                    record_pointer: record_pointer.clone(),
                });
            }
        }
        for (key, metadata) in &new_entries {
            let unchanged = old_entries
                .iter()
                .any(|(k, m)| k == key && m == metadata);
            if !unchanged {
                ops.push(TreeOp::Add {
                    key: key.clone(),
                    value: EntryValue {
                        record_pointer: record_pointer.clone(),
                        metadata: metadata.clone(),
                    },
                });
            }
        }
        if ops.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.write();
        self.apply_ops(ops)?;
        self.with_tree(|tree| tree.sync())?;
        self.cache.clear();
        Ok(())
    }

    /// Applies a batch, rebuilding once on `TreeFull` and re-applying
    /// whatever had not been processed yet.
    fn apply_ops(&self, ops: Vec<TreeOp>) -> Result<()> {
        let outcome: std::result::Result<(), FailedTransaction> =
            self.with_tree(|tree| Ok(tree.transaction(&ops)))?;
        match outcome {
            Ok(()) => Ok(()),
            Err(failed) if IndexError::is_tree_full(&failed.error) => {
                debug!(
                    index = %self.def.description(),
                    processed = failed.processed,
                    "tree full, rebuilding before re-applying remaining ops"
                );
                self.rebuild_locked()?;
                let remaining = ops[failed.processed..].to_vec();
                let retry: std::result::Result<(), FailedTransaction> =
                    self.with_tree(|tree| Ok(tree.transaction(&remaining)))?;
                retry.map_err(|failed| failed.error)
            }
            Err(failed) => Err(failed.error),
        }
    }

    pub fn query(&self, op: &str, value: QueryValue) -> Result<Arc<IndexQueryResults>> {
        self.query_filtered(op, value, None)
    }

    /// Like [`DataIndex::query`], intersecting results with a previous
    /// result set by record pointer. Filtered queries bypass the cache.
    pub fn query_filtered(
        &self,
        op: &str,
        value: QueryValue,
        filter: Option<&IndexQueryResults>,
    ) -> Result<Arc<IndexQueryResults>> {
        let strategy = strategy_for(self.def.index_type);
        if !strategy.valid_operators().contains(&op) {
            return Err(IndexError::InvalidArgument(format!(
                "operator {:?} is not supported by {}",
                op,
                self.def.description()
            ))
            .into());
        }

        let fingerprint = value.fingerprint();
        if filter.is_none() {
            if let Some(hit) = self.cache.get(op, &fingerprint) {
                return Ok(hit);
            }
        }

        let filter_set = match filter {
            Some(results) => Some(self.pointer_set(results)?),
            None => None,
        };

        let _guard = self.lock.read();
        let tree_result =
            self.with_tree(|tree| strategy.query(&self.def, tree, op, &value, filter_set))?;
        let results = Arc::new(self.decode_results(tree_result)?);
        if filter.is_none() {
            self.cache.put(op, fingerprint, Arc::clone(&results));
        }
        Ok(results)
    }

    pub fn count(&self, op: &str, value: QueryValue) -> Result<u64> {
        Ok(self.query(op, value)?.len() as u64)
    }

    /// Paginates the index in key order without an operator.
    pub fn take(&self, skip: usize, take: usize, ascending: bool) -> Result<IndexQueryResults> {
        let _guard = self.lock.read();
        let tree_result = self.with_tree(|tree| tree.take_entries(skip, take, ascending))?;
        self.decode_results(tree_result)
    }

    fn pointer_set(&self, results: &IndexQueryResults) -> Result<HashSet<Vec<u8>>> {
        let mut set = HashSet::with_capacity(results.len());
        for result in &results.results {
            if let Some((wildcards, key)) = self.def.path.match_record_path(&result.path) {
                set.insert(RecordPointer::new(wildcards, key).encode()?);
            }
        }
        Ok(set)
    }

    fn decode_results(&self, tree_result: TreeSearchResult) -> Result<IndexQueryResults> {
        let metadata_keys = self.def.metadata_keys();
        let mut results = IndexQueryResults {
            results: Vec::with_capacity(tree_result.value_count()),
            filter_key: Some("path".to_string()),
        };
        for entry in &tree_result.entries {
            for value in &entry.values {
                results.results.push(IndexQueryResult::from_tree_value(
                    &self.def.path,
                    &entry.key,
                    &value.record_pointer,
                    &metadata_keys,
                    &value.metadata,
                )?);
            }
        }
        Ok(results)
    }
}
