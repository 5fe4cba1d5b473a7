//! Core data model for the analysis engine.
//!
//! A [`ReviewBatch`] is one location's reviews plus the analysis dimensions
//! requested for it - the unit of work the orchestrator schedules. The engine
//! emits one [`AnalysisResult`] per input batch and a [`RunReport`] for the
//! run as a whole.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cost::CostRecord;

/// A single customer review as received from the review source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    /// Display name of the reviewer
    pub author: String,

    /// Star rating, 1-5
    pub rating: u8,

    /// Free-text body of the review
    pub text: String,

    /// Review date as provided by the source (kept verbatim; sources disagree
    /// on formats and the date never participates in analysis identity)
    pub date: String,
}

/// One location's reviews plus the analysis dimensions requested for it.
///
/// Immutable once constructed; the fingerprint of a batch is derived from its
/// reviews, location id, and dimensions (see [`crate::fingerprint`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewBatch {
    /// Stable identifier of the business location
    pub location_id: String,

    /// Human-readable location name
    pub location_name: String,

    /// Street address of the location
    pub address: String,

    /// The reviews to analyze
    pub reviews: Vec<Review>,

    /// Analysis dimensions requested for this batch (e.g. "food_quality")
    pub dimensions: Vec<String>,
}

/// Overall sentiment the service judged for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Mixed,
}

/// The service's judgment for a single analysis dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    /// Score on a 1-5 scale; `None` when the reviews gave the service nothing
    /// to judge this dimension on
    pub score: Option<f64>,

    /// Overall sentiment for this dimension
    pub sentiment: Sentiment,

    /// Recurring themes the service extracted
    #[serde(default)]
    pub themes: Vec<String>,

    /// Representative quotes from the reviews
    #[serde(default)]
    pub quotes: Vec<String>,
}

/// Token usage reported by the analysis service for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens billed at the full input rate
    pub input_tokens: u64,

    /// Tokens billed at the output rate
    pub output_tokens: u64,

    /// Tokens served from the provider's prompt cache (discounted rate)
    pub cached_tokens: u64,
}

/// Whether a result was served from the cache or freshly computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Cached,
    Fresh,
}

/// Terminal outcome of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Scores were obtained, from the cache or from the service.
    Analyzed {
        /// Per-dimension judgments, keyed by dimension name
        scores: BTreeMap<String, DimensionScore>,
        /// Requested dimensions the response did not cover (partial success)
        missing_dimensions: Vec<String>,
        /// Where the scores came from
        source: ResultSource,
    },

    /// The unit failed after exhausting retries, or hit a non-retryable error.
    Failed { error: String },

    /// The unit was never dispatched (empty batch, missing location id).
    Skipped { reason: String },
}

/// Per-location output of the engine, consumed by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub location_id: String,
    pub location_name: String,

    /// Number of reviews in the analyzed batch; used as the ranking tie-break
    pub review_count: usize,

    pub outcome: UnitOutcome,
}

impl AnalysisResult {
    /// True if this unit produced scores (cached or fresh).
    pub fn is_analyzed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Analyzed { .. })
    }

    /// True if this unit failed after dispatch.
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Failed { .. })
    }

    /// The scores, if this unit was analyzed.
    pub fn scores(&self) -> Option<&BTreeMap<String, DimensionScore>> {
        match &self.outcome {
            UnitOutcome::Analyzed { scores, .. } => Some(scores),
            _ => None,
        }
    }
}

/// Run-level outcome reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every unit was analyzed or skipped
    Completed,

    /// At least one unit failed; the rest completed normally
    CompletedWithFailures,

    /// The service reported quota exhaustion; in-flight work finished,
    /// everything else was left for a resumed run
    QuotaExceeded,

    /// The run was canceled; already-completed units remain cached
    Aborted,
}

/// Everything the caller gets back from one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,

    /// One result per input batch, in no particular order
    pub results: Vec<AnalysisResult>,

    /// Final cost snapshot for the run
    pub cost: CostRecord,
}

impl RunReport {
    /// Number of units that produced scores.
    pub fn analyzed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_analyzed()).count()
    }

    /// Number of units that failed.
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_failed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_predicates() {
        let analyzed = AnalysisResult {
            location_id: "L1".to_string(),
            location_name: "Central".to_string(),
            review_count: 2,
            outcome: UnitOutcome::Analyzed {
                scores: BTreeMap::new(),
                missing_dimensions: vec![],
                source: ResultSource::Fresh,
            },
        };
        assert!(analyzed.is_analyzed());
        assert!(!analyzed.is_failed());

        let failed = AnalysisResult {
            location_id: "L2".to_string(),
            location_name: "North".to_string(),
            review_count: 0,
            outcome: UnitOutcome::Failed {
                error: "retries exhausted".to_string(),
            },
        };
        assert!(failed.is_failed());
        assert!(failed.scores().is_none());
    }

    #[test]
    fn unit_outcome_serializes_with_status_tag() {
        let outcome = UnitOutcome::Skipped {
            reason: "no reviews".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "no reviews");
    }
}
