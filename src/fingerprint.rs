//! Content-addressed identity for units of work.
//!
//! A fingerprint covers exactly the inputs that determine an analysis result:
//! the review texts, the location id, and the requested dimensions. Review
//! and dimension ordering is canonicalized before hashing, so re-fetching the
//! same reviews in a different order still hits the cache. Worker counts,
//! retry settings, and service wording deliberately do not participate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::ReviewBatch;

/// A stable content hash identifying one unit of analysis work.
///
/// Stored as the lowercase hex digest; this is also the cache key format on
/// disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the fingerprint of a batch. Pure and total.
pub fn fingerprint(batch: &ReviewBatch) -> Fingerprint {
    let mut texts: Vec<&str> = batch.reviews.iter().map(|r| r.text.as_str()).collect();
    texts.sort_unstable();

    let mut dimensions: Vec<&str> = batch.dimensions.iter().map(String::as_str).collect();
    dimensions.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(batch.location_id.as_bytes());
    hasher.update([0x1e]);
    for text in texts {
        hasher.update(text.as_bytes());
        // 0x1f separator keeps adjacent texts from hashing like one longer text
        hasher.update([0x1f]);
    }
    hasher.update([0x1e]);
    for dimension in dimensions {
        hasher.update(dimension.as_bytes());
        hasher.update([0x1f]);
    }

    Fingerprint(format!("{:x}", hasher.finalize()))
}
