//! # Normal Index
//!
//! Indexes one scalar field of each record under the indexed path. With
//! the `{key}` sentinel the record's own key is indexed instead, which
//! makes sorted-by-name pagination an index walk.
//!
//! A record whose field is absent projects to an `Undefined` entry so the
//! index can answer `!exists` without touching the primary store.

use hashbrown::HashSet;

use eyre::Result;

use super::{scalar_tree_query, IndexDefinition, IndexStrategy, IndexType, ProjectedEntry};
use crate::btree::{BinaryBTree, SearchOptions, TreeSearchResult};
use crate::encoding::IndexKey;
use crate::index::query::QueryValue;
use crate::store::NodeValue;

pub struct NormalIndex;

pub const SCALAR_OPERATORS: &[&str] = &[
    "<", "<=", "==", "!=", ">", ">=", "in", "!in", "between", "!between", "like", "!like",
    "matches", "!matches", "exists", "!exists",
];

impl IndexStrategy for NormalIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Normal
    }

    fn extra_metadata_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        SCALAR_OPERATORS
    }

    fn project(
        &self,
        def: &IndexDefinition,
        child_key: &str,
        value: &NodeValue,
    ) -> Result<Vec<ProjectedEntry>> {
        let raw = if def.indexes_child_key() {
            IndexKey::String(child_key.to_string())
        } else {
            value
                .get(&def.key)
                .map(NodeValue::to_key)
                .unwrap_or(IndexKey::Undefined)
        };
        Ok(vec![ProjectedEntry {
            key: def.normalize(raw),
            extra: Vec::new(),
        }])
    }

    fn query(
        &self,
        def: &IndexDefinition,
        tree: &mut BinaryBTree,
        op: &str,
        value: &QueryValue,
        filter: Option<HashSet<Vec<u8>>>,
    ) -> Result<TreeSearchResult> {
        let query = scalar_tree_query(def, op, value)?;
        tree.search(&query, &SearchOptions { filter })
    }
}
