//! In-memory cache implementation.
//!
//! Suitable for tests and dry runs; entries are lost on restart. Supports
//! poisoning individual keys to exercise the orchestrator's corruption
//! handling.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;

use super::{CacheEntry, CacheStore};

/// In-memory implementation of [`CacheStore`].
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    poisoned: RwLock<HashSet<String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Make reads of this key fail with a storage error, simulating a
    /// corrupted entry. Callers are expected to degrade it to a miss.
    pub fn poison(&self, fingerprint: &Fingerprint) {
        self.poisoned
            .write()
            .insert(fingerprint.as_str().to_string());
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        if self.poisoned.read().contains(fingerprint.as_str()) {
            return Err(EngineError::Storage(format!(
                "corrupt cache entry for {fingerprint}"
            )));
        }
        Ok(self.entries.read().get(fingerprint.as_str()).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let key = entry.fingerprint.as_str().to_string();
        // A successful rewrite replaces whatever corrupt state was there
        self.poisoned.write().remove(&key);
        self.entries.write().insert(key, entry);
        Ok(())
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.entries.read().contains_key(fingerprint.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(fp: &Fingerprint) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.clone(),
            dimension_scores: BTreeMap::new(),
            usage: Default::default(),
            cost_usd: 0.0,
            computed_at: chrono::Utc::now(),
        }
    }

    fn some_fingerprint() -> Fingerprint {
        crate::fingerprint::fingerprint(&crate::types::ReviewBatch {
            location_id: "L1".to_string(),
            location_name: String::new(),
            address: String::new(),
            reviews: vec![],
            dimensions: vec![],
        })
    }

    #[tokio::test]
    async fn poisoned_key_errors_until_rewritten() {
        let cache = InMemoryCache::new();
        let fp = some_fingerprint();

        cache.put(entry(&fp)).await.unwrap();
        cache.poison(&fp);
        assert!(cache.get(&fp).await.is_err());

        cache.put(entry(&fp)).await.unwrap();
        assert!(cache.get(&fp).await.unwrap().is_some());
    }
}
