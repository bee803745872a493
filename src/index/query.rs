//! # Query Values and Results
//!
//! The query front-end is stringly typed on the operator (`">="`,
//! `"fulltext:contains"`, ...), where each index type validates the operator
//! against its own list, and strongly typed on the value side through
//! [`QueryValue`].
//!
//! Results decode tree matches back into primary-store coordinates: the
//! record's key, its absolute path (wildcard bindings substituted), the
//! indexed value and the co-stored metadata.

use hashbrown::HashMap;

use crate::encoding::{IndexKey, RecordPointer};
use crate::path::PathInfo;

#[derive(Debug, Clone)]
pub enum QueryValue {
    /// Scalar operand for comparison operators.
    Key(IndexKey),
    /// Operand set for `in` / `!in`.
    Keys(Vec<IndexKey>),
    /// Bounds for `between` / `!between`.
    Range(IndexKey, IndexKey),
    /// Pattern or query text for `like`, `matches` and fulltext operators.
    Text(String),
    /// Center and radius (meters) for `geo:nearby`.
    Nearby { lat: f64, long: f64, radius: f64 },
}

impl QueryValue {
    /// Stable byte fingerprint used as part of the query-cache key.
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            QueryValue::Key(k) => {
                buf.push(0);
                k.encode_to(&mut buf);
            }
            QueryValue::Keys(keys) => {
                buf.push(1);
                for k in keys {
                    k.encode_to(&mut buf);
                }
            }
            QueryValue::Range(a, b) => {
                buf.push(2);
                a.encode_to(&mut buf);
                b.encode_to(&mut buf);
            }
            QueryValue::Text(s) => {
                buf.push(3);
                buf.extend_from_slice(s.as_bytes());
            }
            QueryValue::Nearby { lat, long, radius } => {
                buf.push(4);
                buf.extend_from_slice(&lat.to_be_bytes());
                buf.extend_from_slice(&long.to_be_bytes());
                buf.extend_from_slice(&radius.to_be_bytes());
            }
        }
        buf
    }
}

impl From<IndexKey> for QueryValue {
    fn from(key: IndexKey) -> Self {
        QueryValue::Key(key)
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::Text(s.to_string())
    }
}

impl From<i64> for QueryValue {
    fn from(v: i64) -> Self {
        QueryValue::Key(IndexKey::Integer(v))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexQueryResult {
    /// Child key of the record under the indexed collection.
    pub key: String,
    /// Absolute record path with wildcard bindings substituted.
    pub path: String,
    /// The indexed value that matched.
    pub value: IndexKey,
    /// Co-stored metadata, keyed by metadata key name.
    pub metadata: HashMap<String, IndexKey>,
}

impl IndexQueryResult {
    pub fn from_tree_value(
        index_path: &PathInfo,
        key: &IndexKey,
        record_pointer: &[u8],
        metadata_keys: &[String],
        metadata: &[IndexKey],
    ) -> eyre::Result<Self> {
        let (rp, _) = RecordPointer::decode(record_pointer)?;
        Ok(Self {
            key: rp.key().to_string(),
            path: rp.path(index_path),
            value: key.clone(),
            metadata: metadata_keys
                .iter()
                .cloned()
                .zip(metadata.iter().cloned())
                .collect(),
        })
    }
}

/// An ordered result set, as produced by a single index query.
#[derive(Debug, Clone, Default)]
pub struct IndexQueryResults {
    pub results: Vec<IndexQueryResult>,
    /// The key a query planner should use when intersecting this set with
    /// another (the record path).
    pub filter_key: Option<String>,
}

impl IndexQueryResults {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.results.iter().map(|r| r.path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_decodes_record_pointer_coordinates() {
        let info = PathInfo::parse("users/*/posts").unwrap();
        let rp = RecordPointer::new(vec!["u2".to_string()], "p2").encode().unwrap();
        let result = IndexQueryResult::from_tree_value(
            &info,
            &IndexKey::Integer(200),
            &rp,
            &["title".to_string()],
            &[IndexKey::String("B".to_string())],
        )
        .unwrap();

        assert_eq!(result.key, "p2");
        assert_eq!(result.path, "users/u2/posts/p2");
        assert_eq!(result.value, IndexKey::Integer(200));
        assert_eq!(
            result.metadata.get("title"),
            Some(&IndexKey::String("B".to_string()))
        );
    }

    #[test]
    fn fingerprints_differ_by_value_and_shape() {
        let a = QueryValue::Key(IndexKey::Integer(1)).fingerprint();
        let b = QueryValue::Key(IndexKey::Integer(2)).fingerprint();
        let c = QueryValue::Text("1".to_string()).fingerprint();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
