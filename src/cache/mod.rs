//! Durable cache of analysis results, keyed by fingerprint.
//!
//! The cache is what makes runs resumable: a killed process loses nothing it
//! already paid for. The orchestrator reads and writes through the
//! [`CacheStore`] interface only; implementations own their entries and their
//! internal synchronization.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::types::{DimensionScore, TokenUsage};

pub mod in_memory;
pub mod json_file;

pub use in_memory::InMemoryCache;
pub use json_file::JsonFileCache;

/// One cached analysis result plus the usage that paid for it.
///
/// The entry carries its own `usage` and `cost_usd` so the cost ledger can be
/// re-derived from the cache alone after a crash between the cache write and
/// the cost record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,

    /// Per-dimension judgments, keyed by dimension name
    pub dimension_scores: BTreeMap<String, DimensionScore>,

    /// Token usage of the call that produced this entry
    pub usage: TokenUsage,

    /// Dollar cost of that call
    pub cost_usd: f64,

    pub computed_at: DateTime<Utc>,
}

/// Storage trait for the fingerprint -> [`CacheEntry`] mapping.
///
/// `get` never fails on a missing key - absence is `Ok(None)`, not an error.
/// A `put` must be durable before it returns, so a crash immediately after
/// never loses a just-billed result.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a prior result. `Ok(None)` means not cached.
    ///
    /// # Errors
    /// Fails only for I/O or corruption on the key itself; callers are
    /// expected to degrade that to a miss.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    /// Write-through store of a fresh result. Durable before returning.
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Pre-flight existence check without deserializing the full entry.
    async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool>;
}
