//! # Array Index
//!
//! Indexes every element of an array field, one tree entry per distinct
//! element, so `contains` becomes a plain key lookup. Updates diff the old
//! and new element sets; only elements that actually appeared or vanished
//! touch the tree.
//!
//! `contains` translates to `==` on the tree. `!contains` translates to
//! `!=`, but a record with elements `[a, b]` also shows up under `a` when
//! looking for "does not contain b", so the `==` matches are subtracted
//! from the complement before results leave the index.

use hashbrown::HashSet;

use eyre::Result;

use super::{scalar_operand, IndexDefinition, IndexStrategy, IndexType, ProjectedEntry};
use crate::btree::{BinaryBTree, SearchOptions, TreeQuery, TreeSearchResult};
use crate::encoding::IndexKey;
use crate::error::IndexError;
use crate::index::query::QueryValue;
use crate::store::NodeValue;

pub struct ArrayIndex;

impl IndexStrategy for ArrayIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Array
    }

    fn extra_metadata_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &["contains", "!contains"]
    }

    fn project(
        &self,
        def: &IndexDefinition,
        _child_key: &str,
        value: &NodeValue,
    ) -> Result<Vec<ProjectedEntry>> {
        let Some(NodeValue::Array(items)) = value.get(&def.key) else {
            return Ok(Vec::new());
        };
        let mut seen: Vec<IndexKey> = Vec::new();
        for item in items {
            let key = def.normalize(item.to_key());
            if key.is_undefined() || seen.contains(&key) {
                continue;
            }
            seen.push(key);
        }
        Ok(seen
            .into_iter()
            .map(|key| ProjectedEntry {
                key,
                extra: Vec::new(),
            })
            .collect())
    }

    fn query(
        &self,
        def: &IndexDefinition,
        tree: &mut BinaryBTree,
        op: &str,
        value: &QueryValue,
        filter: Option<HashSet<Vec<u8>>>,
    ) -> Result<TreeSearchResult> {
        let operand = def.normalize(scalar_operand(op, value)?);
        match op {
            "contains" => tree.search(
                &TreeQuery::Equal(operand),
                &SearchOptions { filter },
            ),
            "!contains" => {
                let matching = tree.search(
                    &TreeQuery::Equal(operand.clone()),
                    &SearchOptions::default(),
                )?;
                let exclude: HashSet<Vec<u8>> = matching
                    .entries
                    .iter()
                    .flat_map(|e| e.values.iter().map(|v| v.record_pointer.clone()))
                    .collect();

                let mut complement = tree.search(
                    &TreeQuery::NotEqual(operand),
                    &SearchOptions { filter },
                )?;
                for entry in &mut complement.entries {
                    entry
                        .values
                        .retain(|v| !exclude.contains(&v.record_pointer));
                }
                complement.entries.retain(|e| !e.values.is_empty());
                Ok(complement)
            }
            other => Err(IndexError::InvalidArgument(format!(
                "operator {:?} is not supported by an array index",
                other
            ))
            .into()),
        }
    }
}
