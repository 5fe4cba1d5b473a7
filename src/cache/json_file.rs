//! File-backed cache implementation.
//!
//! The whole cache is one JSON object mapping fingerprint hex strings to
//! serialized entries. The full map lives in memory; every `put` rewrites the
//! file through a temp-file + fsync + rename sequence, so the on-disk copy is
//! always a complete, parseable snapshot and a crash mid-write leaves the
//! previous snapshot intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

use super::{CacheEntry, CacheStore};

/// Durable JSON-file implementation of [`CacheStore`].
pub struct JsonFileCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Serializes the insert + rewrite sequence across concurrent `put`s.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileCache {
    /// Open (or create) a cache file.
    ///
    /// An unreadable file or an entry that no longer deserializes degrades to
    /// a miss for the affected keys: recomputation is idempotent and strictly
    /// preferable to aborting the run.
    ///
    /// # Errors
    /// Fails only when the parent directory cannot be created - that makes
    /// the store unusable entirely, which is a run-level condition.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => Self::parse_snapshot(&path, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No existing cache file, starting empty");
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Cache file unreadable, starting empty"
                );
                HashMap::new()
            }
        };

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            "Opened analysis cache"
        );

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Decode a snapshot, dropping individually corrupt entries.
    fn parse_snapshot(path: &Path, bytes: &[u8]) -> HashMap<String, CacheEntry> {
        let raw: serde_json::Map<String, serde_json::Value> = match serde_json::from_slice(bytes) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Cache file corrupt, treating all entries as misses"
                );
                return HashMap::new();
            }
        };

        let mut entries = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => {
                    entries.insert(key, entry);
                }
                Err(e) => {
                    tracing::warn!(
                        fingerprint = %key,
                        error = %e,
                        "Corrupt cache entry, treating as miss"
                    );
                }
            }
        }
        entries
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rewrite the on-disk snapshot from the in-memory map.
    async fn flush(&self) -> Result<()> {
        let snapshot = {
            let entries = self.entries.read();
            serde_json::to_vec_pretty(&*entries)?
        };

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&snapshot).await?;
        // Flushed to disk before the rename makes it visible
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonFileCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().get(fingerprint.as_str()).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.entries
            .write()
            .insert(entry.fingerprint.as_str().to_string(), entry);
        self.flush().await
    }

    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.entries.read().contains_key(fingerprint.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::types::{DimensionScore, Review, ReviewBatch, Sentiment, TokenUsage};
    use std::collections::BTreeMap;

    fn sample_batch() -> ReviewBatch {
        ReviewBatch {
            location_id: "L1".to_string(),
            location_name: "Central".to_string(),
            address: "1 Main St".to_string(),
            reviews: vec![Review {
                author: "a".to_string(),
                rating: 5,
                text: "the pastries here are excellent".to_string(),
                date: "2024-03-01".to_string(),
            }],
            dimensions: vec!["food_quality".to_string()],
        }
    }

    fn sample_entry(fp: Fingerprint) -> CacheEntry {
        let mut scores = BTreeMap::new();
        scores.insert(
            "food_quality".to_string(),
            DimensionScore {
                score: Some(4.5),
                sentiment: Sentiment::Positive,
                themes: vec!["pastries".to_string()],
                quotes: vec![],
            },
        );
        CacheEntry {
            fingerprint: fp,
            dimension_scores: scores,
            usage: TokenUsage {
                input_tokens: 1800,
                output_tokens: 600,
                cached_tokens: 0,
            },
            cost_usd: 0.0144,
            computed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_then_get_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let fp = fingerprint(&sample_batch());

        {
            let cache = JsonFileCache::open(&path).await.unwrap();
            assert!(cache.get(&fp).await.unwrap().is_none());
            cache.put(sample_entry(fp.clone())).await.unwrap();
            assert!(cache.contains(&fp).await.unwrap());
        }

        // Reopen from disk: the entry must have survived the first handle
        let reopened = JsonFileCache::open(&path).await.unwrap();
        let entry = reopened.get(&fp).await.unwrap().expect("entry survived");
        assert_eq!(entry.fingerprint, fp);
        assert_eq!(entry.usage.input_tokens, 1800);
        assert_eq!(
            entry.dimension_scores["food_quality"].score,
            Some(4.5)
        );
    }

    #[tokio::test]
    async fn missing_key_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonFileCache::open(dir.path().join("cache.json"))
            .await
            .unwrap();
        let fp = fingerprint(&sample_batch());
        assert!(cache.get(&fp).await.unwrap().is_none());
        assert!(!cache.contains(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        tokio::fs::write(&path, b"{not valid json").await.unwrap();

        let cache = JsonFileCache::open(&path).await.unwrap();
        assert!(cache.is_empty());

        // And the cache is still writable afterwards
        let fp = fingerprint(&sample_batch());
        cache.put(sample_entry(fp.clone())).await.unwrap();
        assert!(cache.contains(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_entry_is_dropped_but_valid_entries_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let fp = fingerprint(&sample_batch());

        {
            let cache = JsonFileCache::open(&path).await.unwrap();
            cache.put(sample_entry(fp.clone())).await.unwrap();
        }

        // Splice a garbage entry into the snapshot alongside the valid one
        let mut map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        map.insert("deadbeef".to_string(), serde_json::json!({"bogus": true}));
        tokio::fs::write(&path, serde_json::to_vec(&map).unwrap())
            .await
            .unwrap();

        let cache = JsonFileCache::open(&path).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fp).await.unwrap().is_some());
    }
}
