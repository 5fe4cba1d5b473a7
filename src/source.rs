//! Review source boundary.
//!
//! The engine treats review collection as an external collaborator: anything
//! that can produce a finite sequence of [`ReviewBatch`] values can feed the
//! orchestrator. The file-backed source here covers exports and fixtures; a
//! scraping connector would implement the same trait.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::ReviewBatch;

/// Reviews shorter than this carry too little signal to analyze.
pub const DEFAULT_MIN_REVIEW_CHARS: usize = 20;

/// Errors from a review source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source has no review data for the requested locations
    #[error("no review data available: {0}")]
    NoData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Trait for producing review batches.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    /// Fetch batches for the given locations. An empty `location_ids` slice
    /// means all locations the source knows about.
    async fn fetch(
        &self,
        location_ids: &[String],
    ) -> std::result::Result<Vec<ReviewBatch>, SourceError>;

    /// Like [`fetch`](Self::fetch), mapping the `NoData` condition to zero
    /// batches - the treatment the orchestrator wants.
    async fn fetch_or_empty(
        &self,
        location_ids: &[String],
    ) -> std::result::Result<Vec<ReviewBatch>, SourceError> {
        match self.fetch(location_ids).await {
            Ok(batches) => Ok(batches),
            Err(SourceError::NoData(reason)) => {
                tracing::warn!(reason = %reason, "Source has no data, continuing with zero batches");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

/// File-backed source: a JSON array of [`ReviewBatch`] values.
pub struct JsonFileSource {
    path: PathBuf,
    min_review_chars: usize,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_review_chars: DEFAULT_MIN_REVIEW_CHARS,
        }
    }

    /// Override the minimum review length filter.
    pub fn with_min_review_chars(mut self, min_review_chars: usize) -> Self {
        self.min_review_chars = min_review_chars;
        self
    }
}

#[async_trait]
impl ReviewSource for JsonFileSource {
    async fn fetch(
        &self,
        location_ids: &[String],
    ) -> std::result::Result<Vec<ReviewBatch>, SourceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NoData(format!(
                    "review file not found: {}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut batches: Vec<ReviewBatch> = serde_json::from_slice(&bytes)?;

        if !location_ids.is_empty() {
            batches.retain(|b| location_ids.contains(&b.location_id));
        }

        let mut filtered = 0usize;
        for batch in &mut batches {
            let before = batch.reviews.len();
            batch
                .reviews
                .retain(|r| r.text.trim().len() >= self.min_review_chars);
            filtered += before - batch.reviews.len();
        }
        if filtered > 0 {
            tracing::debug!(filtered, "Dropped reviews below the minimum length");
        }

        if batches.is_empty() {
            return Err(SourceError::NoData(format!(
                "no batches for the requested locations in {}",
                self.path.display()
            )));
        }

        Ok(batches)
    }
}
