//! The analysis orchestrator: turns an unbounded list of review batches into
//! a bounded number of paid service calls.
//!
//! Per unit of work the state machine is `pending -> cache_hit -> emitted` or
//! `pending -> dispatched -> {retrying -> dispatched}* -> {succeeded |
//! failed} -> emitted`; nothing transitions out of `emitted`. Correctness
//! guarantees:
//!
//! - at most `max_concurrency` service calls outstanding at any instant (a
//!   hard ceiling, enforced by a semaphore held across the whole call)
//! - at most one outstanding call per fingerprint: concurrent units that
//!   collapse to the same fingerprint coalesce onto one call via a per-run
//!   in-flight map
//! - a fresh result's cache write lands before its cost record, so a crash
//!   between the two leaves a replayable cache hit rather than a billed but
//!   lost result
//! - no cost is ever recorded for work abandoned before a response arrived

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{AnalysisClient, AnalysisRequest};
use crate::cache::{CacheEntry, CacheStore};
use crate::cost::{CostTracker, Pricing};
use crate::error::AnalyzerError;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::types::{
    AnalysisResult, DimensionScore, ResultSource, ReviewBatch, RunOutcome, RunReport, UnitOutcome,
};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of service calls outstanding at any instant
    pub max_concurrency: usize,

    /// Maximum number of retry attempts per unit before giving up
    pub max_retries: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// Random jitter added to each backoff, in milliseconds
    pub jitter_ms: u64,

    /// Timeout for each individual service call in milliseconds
    pub timeout_ms: u64,

    /// Price table used to convert token usage to dollars
    pub pricing: Pricing,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_retries: 5,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10000,
            jitter_ms: 250,
            timeout_ms: 600_000,
            pricing: Pricing::default(),
        }
    }
}

/// Bounded-retry state, kept separate from the dispatch loop so the backoff
/// schedule is testable without simulating real delays.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl From<&OrchestratorConfig> for RetryPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
            jitter_ms: config.jitter_ms,
        }
    }
}

impl RetryPolicy {
    /// Base delay before retry `attempt` (0-based), capped at
    /// `max_backoff_ms`. `None` when retries are exhausted.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        Some(Duration::from_millis(exponential))
    }

    /// Backoff plus random jitter, so synchronized failures don't retry in
    /// lockstep against a rate-limited service.
    pub fn jittered_backoff(&self, attempt: u32) -> Option<Duration> {
        let base = self.backoff(attempt)?;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_ms)
        };
        Some(base + Duration::from_millis(jitter))
    }
}

/// Outcome shared between a coalescing leader and its waiting followers.
#[derive(Debug, Clone)]
struct CoalescedOk {
    scores: BTreeMap<String, DimensionScore>,
    missing_dimensions: Vec<String>,
}

type CoalescedResult = Result<CoalescedOk, String>;
type InflightMap = DashMap<Fingerprint, watch::Receiver<Option<CoalescedResult>>>;

/// Shared state for one orchestration run.
struct RunContext<C, S> {
    client: Arc<C>,
    cache: Arc<S>,
    cost: Arc<CostTracker>,
    config: OrchestratorConfig,
    semaphore: Arc<Semaphore>,
    inflight: Arc<InflightMap>,
    quota_hit: Arc<AtomicBool>,
    units_in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl<C, S> Clone for RunContext<C, S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            cache: self.cache.clone(),
            cost: self.cost.clone(),
            config: self.config.clone(),
            semaphore: self.semaphore.clone(),
            inflight: self.inflight.clone(),
            quota_hit: self.quota_hit.clone(),
            units_in_flight: self.units_in_flight.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// The worker pool / orchestrator.
///
/// The cache store and cost tracker are injected rather than ambient so tests
/// can substitute their own; they are the only mutable state shared across
/// workers, and each handles its own synchronization.
pub struct Orchestrator<C, S> {
    client: Arc<C>,
    cache: Arc<S>,
    cost: Arc<CostTracker>,
    config: OrchestratorConfig,
}

impl<C, S> Orchestrator<C, S>
where
    C: AnalysisClient + 'static,
    S: CacheStore + 'static,
{
    pub fn new(
        client: Arc<C>,
        cache: Arc<S>,
        cost: Arc<CostTracker>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            cache,
            cost,
            config,
        }
    }

    /// The cost tracker, for mid-run progress polling.
    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost
    }

    /// Analyze every batch and return the completed result set.
    pub async fn run(&self, batches: Vec<ReviewBatch>) -> RunReport {
        self.run_with_cancel(batches, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), with caller-controlled cancellation.
    ///
    /// Cancellation stops dispatch of new work immediately and abandons
    /// in-flight calls; abandoned work records no cost, and everything
    /// already completed stays cached for a resumed run.
    #[tracing::instrument(skip(self, batches, cancel), fields(batches = batches.len()))]
    pub async fn run_with_cancel(
        &self,
        batches: Vec<ReviewBatch>,
        cancel: CancellationToken,
    ) -> RunReport {
        tracing::info!(
            batches = batches.len(),
            max_concurrency = self.config.max_concurrency,
            "Starting orchestration run"
        );

        let ctx = RunContext {
            client: self.client.clone(),
            cache: self.cache.clone(),
            cost: self.cost.clone(),
            config: self.config.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrency)),
            // In-flight map lives for exactly one run
            inflight: Arc::new(DashMap::new()),
            quota_hit: Arc::new(AtomicBool::new(false)),
            units_in_flight: Arc::new(AtomicUsize::new(0)),
            cancel,
        };

        let mut join_set: JoinSet<AnalysisResult> = JoinSet::new();
        for batch in batches {
            join_set.spawn(analyze_unit(ctx.clone(), batch));
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Unit task panicked");
                }
            }
        }

        let outcome = if ctx.cancel.is_cancelled() {
            RunOutcome::Aborted
        } else if ctx.quota_hit.load(Ordering::Acquire) {
            RunOutcome::QuotaExceeded
        } else if results.iter().any(|r| r.is_failed()) {
            RunOutcome::CompletedWithFailures
        } else {
            RunOutcome::Completed
        };

        let cost = self.cost.snapshot();
        tracing::info!(
            outcome = ?outcome,
            analyzed = results.iter().filter(|r| r.is_analyzed()).count(),
            failed = results.iter().filter(|r| r.is_failed()).count(),
            cache_hits = cost.cache_hits,
            fresh_calls = cost.fresh_calls,
            cost_usd = cost.cost_usd,
            "Orchestration run finished"
        );

        RunReport {
            outcome,
            results,
            cost,
        }
    }
}

/// Drive one unit of work to its emitted result. Never panics the run:
/// every failure path folds into the returned [`AnalysisResult`].
async fn analyze_unit<C, S>(ctx: RunContext<C, S>, batch: ReviewBatch) -> AnalysisResult
where
    C: AnalysisClient + 'static,
    S: CacheStore + 'static,
{
    if batch.location_id.trim().is_empty() {
        tracing::warn!(location_name = %batch.location_name, "Skipping batch with no location id");
        return skipped(&batch, "missing location id");
    }
    if batch.reviews.is_empty() {
        tracing::warn!(location_id = %batch.location_id, "Skipping batch with no reviews");
        return skipped(&batch, "no reviews");
    }

    let fp = fingerprint(&batch);

    // Cache hits short-circuit without consuming a worker slot
    match ctx.cache.get(&fp).await {
        Ok(Some(entry)) => {
            tracing::debug!(location_id = %batch.location_id, fingerprint = %fp, "Cache hit");
            ctx.cost.record_cache_hit();
            let missing = missing_dimensions(&batch, &entry.dimension_scores);
            return analyzed(&batch, entry.dimension_scores, missing, ResultSource::Cached);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(
                location_id = %batch.location_id,
                fingerprint = %fp,
                error = %e,
                "Cache read failed, treating as miss"
            );
        }
    }

    // Coalesce with any in-flight call for the same fingerprint: exactly one
    // paid call may be outstanding per fingerprint at any time.
    enum Role {
        Leader(watch::Sender<Option<CoalescedResult>>),
        Follower(watch::Receiver<Option<CoalescedResult>>),
    }

    let role = match ctx.inflight.entry(fp.clone()) {
        dashmap::mapref::entry::Entry::Occupied(occupied) => Role::Follower(occupied.get().clone()),
        dashmap::mapref::entry::Entry::Vacant(vacant) => {
            let (tx, rx) = watch::channel(None);
            vacant.insert(rx);
            Role::Leader(tx)
        }
    };

    match role {
        Role::Follower(mut rx) => {
            tracing::debug!(
                location_id = %batch.location_id,
                fingerprint = %fp,
                "Awaiting in-flight call for the same fingerprint"
            );
            loop {
                if rx.borrow().is_some() {
                    break;
                }
                if rx.changed().await.is_err() {
                    // Leader dropped without publishing (canceled mid-flight)
                    break;
                }
            }
            let shared = rx.borrow().clone();
            match shared {
                Some(Ok(ok)) => {
                    // The leader's call paid for this result; followers count
                    // as cache hits with zero token cost
                    ctx.cost.record_cache_hit();
                    analyzed(&batch, ok.scores, ok.missing_dimensions, ResultSource::Cached)
                }
                Some(Err(error)) => failed(&batch, error),
                None => failed(&batch, "coalesced call abandoned".to_string()),
            }
        }
        Role::Leader(tx) => {
            // Another run may have completed this fingerprint between our
            // cache miss and winning the in-flight entry
            if let Ok(Some(entry)) = ctx.cache.get(&fp).await {
                ctx.inflight.remove(&fp);
                ctx.cost.record_cache_hit();
                let missing = missing_dimensions(&batch, &entry.dimension_scores);
                let _ = tx.send(Some(Ok(CoalescedOk {
                    scores: entry.dimension_scores.clone(),
                    missing_dimensions: missing.clone(),
                })));
                return analyzed(&batch, entry.dimension_scores, missing, ResultSource::Cached);
            }

            let result = execute_fresh(&ctx, &batch, &fp).await;
            ctx.inflight.remove(&fp);
            let _ = tx.send(Some(result.clone()));

            match result {
                Ok(ok) => analyzed(&batch, ok.scores, ok.missing_dimensions, ResultSource::Fresh),
                Err(error) => failed(&batch, error),
            }
        }
    }
}

/// Dispatch one paid call under the concurrency ceiling, retrying transient
/// failures with jittered exponential backoff.
async fn execute_fresh<C, S>(
    ctx: &RunContext<C, S>,
    batch: &ReviewBatch,
    fp: &Fingerprint,
) -> CoalescedResult
where
    C: AnalysisClient + 'static,
    S: CacheStore + 'static,
{
    if ctx.quota_hit.load(Ordering::Acquire) {
        return Err("quota exhausted before dispatch".to_string());
    }
    if ctx.cancel.is_cancelled() {
        return Err("run canceled before dispatch".to_string());
    }

    // The permit is held across the whole call including retries, so the
    // ceiling bounds outstanding calls at every instant, not on average
    let _permit = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            return Err("run canceled while waiting for a worker slot".to_string());
        }
        permit = ctx.semaphore.clone().acquire_owned() => {
            match permit {
                Ok(permit) => permit,
                Err(_) => return Err("worker pool closed".to_string()),
            }
        }
    };

    let in_flight = ctx.units_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
    let _guard = scopeguard::guard((), |_| {
        ctx.units_in_flight.fetch_sub(1, Ordering::Relaxed);
    });

    let request = AnalysisRequest {
        location_id: batch.location_id.clone(),
        location_name: batch.location_name.clone(),
        reviews: batch.reviews.clone(),
        dimensions: batch.dimensions.clone(),
    };
    let policy = RetryPolicy::from(&ctx.config);
    let mut attempt: u32 = 0;

    loop {
        // Quota exhaustion halts new dispatch, including retry dispatch
        if ctx.quota_hit.load(Ordering::Acquire) {
            return Err("quota exhausted before dispatch".to_string());
        }

        tracing::debug!(
            location_id = %request.location_id,
            fingerprint = %fp,
            attempt,
            in_flight,
            "Dispatching analysis call"
        );

        let call = ctx.client.analyze(&request);
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                // Abandoned before a response arrived: no cost recorded
                tracing::info!(location_id = %request.location_id, "Abandoning in-flight call on cancellation");
                return Err("run canceled mid-flight".to_string());
            }
            result = tokio::time::timeout(Duration::from_millis(ctx.config.timeout_ms), call) => result,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(_elapsed) => Err(AnalyzerError::Transient("analysis call timed out".to_string())),
        };

        match result {
            Ok(response) => {
                let missing = missing_dimensions(batch, &response.dimension_scores);
                if !missing.is_empty() {
                    tracing::warn!(
                        location_id = %request.location_id,
                        missing = ?missing,
                        "Response missing requested dimensions, recording partial result"
                    );
                }

                let cost_usd = ctx.config.pricing.cost_usd(&response.usage);
                let entry = CacheEntry {
                    fingerprint: fp.clone(),
                    dimension_scores: response.dimension_scores.clone(),
                    usage: response.usage.clone(),
                    cost_usd,
                    computed_at: chrono::Utc::now(),
                };

                // Cache write lands before the cost record: a crash between
                // the two replays as a cache hit, and the entry carries its
                // own usage so the ledger is re-derivable
                if let Err(e) = ctx.cache.put(entry).await {
                    tracing::error!(
                        location_id = %request.location_id,
                        fingerprint = %fp,
                        error = %e,
                        "Cache write failed; result is paid for but will be recomputed next run"
                    );
                }
                ctx.cost.record_usage(&response.usage, cost_usd);

                tracing::info!(
                    location_id = %request.location_id,
                    attempt,
                    cost_usd,
                    "Analysis completed"
                );
                return Ok(CoalescedOk {
                    scores: response.dimension_scores,
                    missing_dimensions: missing,
                });
            }
            Err(AnalyzerError::QuotaExhausted(message)) => {
                ctx.quota_hit.store(true, Ordering::Release);
                tracing::error!(
                    location_id = %request.location_id,
                    error = %message,
                    "Quota exhausted, halting new dispatch"
                );
                return Err(format!("quota exhausted: {message}"));
            }
            Err(AnalyzerError::Malformed(message)) => {
                // Deterministic: retrying would bill again for the same garbage
                tracing::warn!(
                    location_id = %request.location_id,
                    error = %message,
                    "Unparsable response, failing unit without retry"
                );
                return Err(format!("malformed response: {message}"));
            }
            Err(AnalyzerError::Transient(message)) => match policy.jittered_backoff(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        location_id = %request.location_id,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient failure, backing off before retry"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return Err("run canceled during backoff".to_string());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                None => {
                    tracing::error!(
                        location_id = %request.location_id,
                        attempts = attempt + 1,
                        error = %message,
                        "Retries exhausted, failing unit"
                    );
                    return Err(format!(
                        "retries exhausted after {} attempts: {message}",
                        attempt + 1
                    ));
                }
            },
        }
    }
}

fn missing_dimensions(
    batch: &ReviewBatch,
    scores: &BTreeMap<String, DimensionScore>,
) -> Vec<String> {
    batch
        .dimensions
        .iter()
        .filter(|d| !scores.contains_key(*d))
        .cloned()
        .collect()
}

fn analyzed(
    batch: &ReviewBatch,
    scores: BTreeMap<String, DimensionScore>,
    missing_dimensions: Vec<String>,
    source: ResultSource,
) -> AnalysisResult {
    AnalysisResult {
        location_id: batch.location_id.clone(),
        location_name: batch.location_name.clone(),
        review_count: batch.reviews.len(),
        outcome: UnitOutcome::Analyzed {
            scores,
            missing_dimensions,
            source,
        },
    }
}

fn failed(batch: &ReviewBatch, error: String) -> AnalysisResult {
    AnalysisResult {
        location_id: batch.location_id.clone(),
        location_name: batch.location_name.clone(),
        review_count: batch.reviews.len(),
        outcome: UnitOutcome::Failed { error },
    }
}

fn skipped(batch: &ReviewBatch, reason: &str) -> AnalysisResult {
    AnalysisResult {
        location_id: batch.location_id.clone(),
        location_name: batch.location_name.clone(),
        review_count: batch.reviews.len(),
        outcome: UnitOutcome::Skipped {
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10000,
            jitter_ms: 0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.backoff(0), Some(Duration::from_millis(1000)));
        assert_eq!(policy.backoff(1), Some(Duration::from_millis(2000)));
        assert_eq!(policy.backoff(2), Some(Duration::from_millis(4000)));
        assert_eq!(policy.backoff(3), Some(Duration::from_millis(8000)));
        // Capped at max_backoff_ms
        assert_eq!(policy.backoff(4), Some(Duration::from_millis(10000)));
    }

    #[test]
    fn backoff_exhausts_at_max_retries() {
        let policy = policy(3);
        assert!(policy.backoff(2).is_some());
        assert_eq!(policy.backoff(3), None);
        assert_eq!(policy.jittered_backoff(3), None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_ms: 250,
            ..policy(5)
        };
        for _ in 0..50 {
            let delay = policy.jittered_backoff(0).unwrap();
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn zero_retries_means_no_backoff_at_all() {
        assert_eq!(policy(0).backoff(0), None);
    }
}
