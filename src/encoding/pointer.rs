//! # Record Pointers
//!
//! A tree value locates the record it was projected from: the wildcard
//! bindings (one per `*` in the index path, in order) plus the child key
//! under the indexed collection.
//!
//! ```text
//! wildcards_len u8
//! wildcard × n   { len u8, ascii bytes }
//! key_len u8 + key bytes
//! ```
//!
//! For an index on `users/*/posts` the record `users/ewout/posts/p1` is
//! stored as wildcards `["ewout"]` and key `p1`; decoding substitutes the
//! bindings back into the index path to recover the absolute record path.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::MAX_RECORD_POINTER_BYTES;
use crate::path::PathInfo;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPointer {
    wildcards: SmallVec<[String; 2]>,
    key: String,
}

impl RecordPointer {
    pub fn new(wildcards: impl IntoIterator<Item = String>, key: impl Into<String>) -> Self {
        Self {
            wildcards: wildcards.into_iter().collect(),
            key: key.into(),
        }
    }

    /// The child key of the record under the indexed collection.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn wildcards(&self) -> &[String] {
        &self.wildcards
    }

    /// Absolute path of the record: the index path with `*` segments
    /// substituted, then the child key appended.
    pub fn path(&self, index_path: &PathInfo) -> String {
        let base = index_path.expand(&self.wildcards);
        if base.is_empty() {
            self.key.clone()
        } else {
            format!("{}/{}", base, self.key)
        }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        buf.push(self.wildcards.len() as u8);
        for wc in &self.wildcards {
            ensure!(
                wc.len() <= u8::MAX as usize,
                "wildcard binding too long: {} bytes",
                wc.len()
            );
            buf.push(wc.len() as u8);
            buf.extend_from_slice(wc.as_bytes());
        }
        ensure!(
            self.key.len() <= u8::MAX as usize,
            "record key too long: {} bytes",
            self.key.len()
        );
        buf.push(self.key.len() as u8);
        buf.extend_from_slice(self.key.as_bytes());

        ensure!(
            buf.len() - start <= MAX_RECORD_POINTER_BYTES,
            "record pointer exceeds {} bytes",
            MAX_RECORD_POINTER_BYTES
        );
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<(RecordPointer, usize)> {
        ensure!(!buf.is_empty(), "empty record pointer");
        let wc_count = buf[0] as usize;
        let mut at = 1;
        let mut wildcards = SmallVec::new();
        for _ in 0..wc_count {
            ensure!(at < buf.len(), "truncated wildcard length");
            let len = buf[at] as usize;
            at += 1;
            ensure!(at + len <= buf.len(), "truncated wildcard binding");
            wildcards.push(std::str::from_utf8(&buf[at..at + len])?.to_string());
            at += len;
        }
        ensure!(at < buf.len(), "truncated key length");
        let key_len = buf[at] as usize;
        at += 1;
        ensure!(at + key_len <= buf.len(), "truncated record key");
        let key = std::str::from_utf8(&buf[at..at + key_len])?.to_string();
        at += key_len;

        Ok((RecordPointer { wildcards, key }, at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_wildcards() {
        let rp = RecordPointer::new(Vec::new(), "song1");
        let bytes = rp.encode().unwrap();
        let (decoded, used) = RecordPointer::decode(&bytes).unwrap();
        assert_eq!(decoded, rp);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn roundtrip_with_wildcards() {
        let rp = RecordPointer::new(vec!["u1".to_string(), "2024".to_string()], "p9");
        let bytes = rp.encode().unwrap();
        let (decoded, _) = RecordPointer::decode(&bytes).unwrap();
        assert_eq!(decoded.wildcards(), ["u1", "2024"]);
        assert_eq!(decoded.key(), "p9");
    }

    #[test]
    fn path_substitutes_wildcards_in_order() {
        let info = PathInfo::parse("users/*/posts/*/comments").unwrap();
        let rp = RecordPointer::new(vec!["ewout".to_string(), "p1".to_string()], "c3");
        assert_eq!(rp.path(&info), "users/ewout/posts/p1/comments/c3");
    }

    #[test]
    fn oversized_key_is_rejected() {
        let rp = RecordPointer::new(Vec::new(), "k".repeat(300));
        assert!(rp.encode().is_err());
    }
}
