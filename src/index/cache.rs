//! # Query Cache
//!
//! Per-index cache of decoded query results, keyed by `(operator, value
//! fingerprint)`. Entries live for a sliding TTL (default 60 s, reset on
//! every hit) and the whole cache is cleared on any mutation, before the
//! index write lock is released, so the next reader can never observe a
//! stale entry.
//!
//! There is no timer thread; expired entries are dropped lazily when they
//! are looked up and wholesale on `clear`. Results are shared out as
//! `Arc` clones so a hit costs no copying.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::query::IndexQueryResults;
use crate::config::QUERY_CACHE_TTL_SECS;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    op: String,
    fingerprint: Vec<u8>,
}

struct CacheSlot {
    results: Arc<IndexQueryResults>,
    expires: Instant,
}

pub struct QueryCache {
    ttl: Duration,
    slots: Mutex<HashMap<CacheKey, CacheSlot>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(QUERY_CACHE_TTL_SECS))
    }
}

impl QueryCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, op: &str, fingerprint: &[u8]) -> Option<Arc<IndexQueryResults>> {
        let key = CacheKey {
            op: op.to_string(),
            fingerprint: fingerprint.to_vec(),
        };
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&key)?;
        if slot.expires <= Instant::now() {
            slots.remove(&key);
            return None;
        }
        slot.expires = Instant::now() + self.ttl;
        Some(Arc::clone(&slot.results))
    }

    pub fn put(&self, op: &str, fingerprint: Vec<u8>, results: Arc<IndexQueryResults>) {
        let key = CacheKey {
            op: op.to_string(),
            fingerprint,
        };
        self.slots.lock().insert(
            key,
            CacheSlot {
                results,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> Arc<IndexQueryResults> {
        Arc::new(IndexQueryResults::default())
    }

    #[test]
    fn hit_and_miss() {
        let cache = QueryCache::default();
        cache.put("==", vec![1, 2], results());

        assert!(cache.get("==", &[1, 2]).is_some());
        assert!(cache.get("==", &[9]).is_none());
        assert!(cache.get("!=", &[1, 2]).is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = QueryCache::with_ttl(Duration::from_millis(10));
        cache.put(">", vec![0], results());
        assert!(cache.get(">", &[0]).is_some());

        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(">", &[0]).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reads_slide_the_expiry() {
        let cache = QueryCache::with_ttl(Duration::from_millis(60));
        cache.put(">", vec![0], results());

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(25));
            assert!(cache.get(">", &[0]).is_some(), "sliding TTL let entry die");
        }
    }

    #[test]
    fn clear_empties_everything() {
        let cache = QueryCache::default();
        cache.put("==", vec![1], results());
        cache.put(">", vec![2], results());
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
