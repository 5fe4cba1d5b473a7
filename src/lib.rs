//! Analysis orchestration and caching engine for customer reviews.
//!
//! This crate turns an unbounded set of review batches into a bounded number
//! of calls to a paid AI text-analysis service:
//! - Content-addressed caching so each unique unit of work is billed at most
//!   once, across runs and across process crashes
//! - In-flight coalescing so concurrent requests for the same fingerprint
//!   share one paid call
//! - A hard concurrency ceiling against the rate-limited service
//! - Bounded retries with jittered exponential backoff, quota-exhaustion
//!   halt, and cancellation that never loses already-paid work
//! - A cost ledger maintained alongside the results
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use reviewlens::{
//!     aggregate, AnthropicClient, AnthropicConfig, CostTracker, JsonFileCache,
//!     Orchestrator, OrchestratorConfig,
//! };
//!
//! let client = Arc::new(AnthropicClient::new(AnthropicConfig::default()));
//! let cache = Arc::new(JsonFileCache::open("cache/analysis.json").await?);
//! let cost = Arc::new(CostTracker::new());
//! let engine = Orchestrator::new(client, cache, cost, OrchestratorConfig::default());
//!
//! let report = engine.run(batches).await;
//! let summary = aggregate(&report.results, 10);
//! println!("{:?} (${:.2})", report.outcome, report.cost.cost_usd);
//! ```

pub mod aggregate;
pub mod analyzer;
pub mod cache;
pub mod cost;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use aggregate::{aggregate, LocationRank, NotAnalyzed, Report, ReportSummary};
pub use analyzer::{
    AnalysisClient, AnalysisRequest, AnalysisResponse, AnthropicClient, AnthropicConfig,
    MockAnalysisClient,
};
pub use cache::{CacheEntry, CacheStore, InMemoryCache, JsonFileCache};
pub use cost::{CostRecord, CostTracker, Pricing};
pub use error::{AnalyzerError, EngineError, Result};
pub use fingerprint::{fingerprint, Fingerprint};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RetryPolicy};
pub use source::{JsonFileSource, ReviewSource, SourceError};
pub use types::{
    AnalysisResult, DimensionScore, ResultSource, Review, ReviewBatch, RunOutcome, RunReport,
    Sentiment, TokenUsage, UnitOutcome,
};
