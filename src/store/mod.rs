//! # Primary Store Interface
//!
//! The index engine never owns record data; it consumes a small read-only
//! view of the primary store during builds and receives change events for
//! incremental maintenance.
//!
//! [`NodeStore`] is that view: enumerate the children of a path (with an
//! optional cap, used by the build pipeline's wildcard fanout limit) and
//! fetch a node's value. [`MemoryStore`] implements it over an in-memory
//! value tree; it backs every test in this crate and doubles as a reference
//! for integrators wiring a real store.
//!
//! Values are schemaless JSON-like [`NodeValue`]s. Object children iterate
//! in key order so enumeration is deterministic.

use std::collections::BTreeMap;

use eyre::{bail, Result};

use crate::encoding::IndexKey;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<NodeValue>),
    Object(BTreeMap<String, NodeValue>),
}

impl NodeValue {
    pub fn object(entries: impl IntoIterator<Item = (String, NodeValue)>) -> NodeValue {
        NodeValue::Object(entries.into_iter().collect())
    }

    pub fn get(&self, key: &str) -> Option<&NodeValue> {
        match self {
            NodeValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Scalar projection used by the index layer. Objects and nulls have no
    /// indexable key representation and project to `Undefined`.
    pub fn to_key(&self) -> IndexKey {
        match self {
            NodeValue::Bool(v) => IndexKey::Boolean(*v),
            NodeValue::Int(v) => IndexKey::Integer(*v),
            NodeValue::Float(v) => IndexKey::Float(*v),
            NodeValue::Date(ms) => IndexKey::Date(*ms),
            NodeValue::String(s) => IndexKey::String(s.clone()),
            NodeValue::Binary(b) => IndexKey::Binary(b.clone()),
            NodeValue::Array(items) => IndexKey::Array(items.iter().map(|v| v.to_key()).collect()),
            NodeValue::Null | NodeValue::Object(_) => IndexKey::Undefined,
        }
    }
}

impl From<&str> for NodeValue {
    fn from(v: &str) -> Self {
        NodeValue::String(v.to_string())
    }
}

impl From<i64> for NodeValue {
    fn from(v: i64) -> Self {
        NodeValue::Int(v)
    }
}

impl From<f64> for NodeValue {
    fn from(v: f64) -> Self {
        NodeValue::Float(v)
    }
}

impl From<bool> for NodeValue {
    fn from(v: bool) -> Self {
        NodeValue::Bool(v)
    }
}

/// Read-only view of the primary store consumed by builds.
pub trait NodeStore {
    /// Child keys of the node at `path`, in deterministic order, capped at
    /// `limit` when given. Non-object nodes and missing paths yield an
    /// empty list.
    fn child_keys(&self, path: &str, limit: Option<usize>) -> Result<Vec<String>>;

    /// The value stored at `path`, or `None` when the path does not exist.
    fn get_value(&self, path: &str) -> Result<Option<NodeValue>>;
}

/// In-memory primary store for tests and fixtures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    root: BTreeMap<String, NodeValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn split_path(path: &str) -> Vec<&str> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        }
    }

    /// Stores a value, creating intermediate objects along the path.
    /// Returns the previous value at the path, if any.
    pub fn set(&mut self, path: &str, value: NodeValue) -> Result<Option<NodeValue>> {
        let parts = Self::split_path(path);
        if parts.is_empty() {
            bail!("cannot set the root node");
        }
        let mut map = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            let entry = map
                .entry((*part).to_string())
                .or_insert_with(|| NodeValue::Object(BTreeMap::new()));
            match entry {
                NodeValue::Object(inner) => map = inner,
                other => {
                    *other = NodeValue::Object(BTreeMap::new());
                    match other {
                        NodeValue::Object(inner) => map = inner,
                        _ => unreachable!(),
                    }
                }
            }
        }
        Ok(map.insert(parts[parts.len() - 1].to_string(), value))
    }

    /// Removes the value at `path`, returning it.
    pub fn remove(&mut self, path: &str) -> Option<NodeValue> {
        let parts = Self::split_path(path);
        let (last, ancestors) = parts.split_last()?;
        let mut map = &mut self.root;
        for part in ancestors {
            match map.get_mut(*part) {
                Some(NodeValue::Object(inner)) => map = inner,
                _ => return None,
            }
        }
        map.remove(*last)
    }

    fn lookup(&self, path: &str) -> Option<&NodeValue> {
        let parts = Self::split_path(path);
        let (first, rest) = parts.split_first()?;
        let mut current = self.root.get(*first)?;
        for part in rest {
            current = current.get(part)?;
        }
        Some(current)
    }
}

impl NodeStore for MemoryStore {
    fn child_keys(&self, path: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let map = if Self::split_path(path).is_empty() {
            Some(&self.root)
        } else {
            match self.lookup(path) {
                Some(NodeValue::Object(map)) => Some(map),
                _ => None,
            }
        };
        let Some(map) = map else {
            return Ok(Vec::new());
        };
        let iter = map.keys().cloned();
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn get_value(&self, path: &str) -> Result<Option<NodeValue>> {
        Ok(self.lookup(path).cloned())
    }
}
