//! Cost accounting for analysis runs.
//!
//! The [`CostTracker`] is the single accumulator every worker reports into.
//! It is pure bookkeeping: no operation here can fail, and `snapshot` holds
//! the lock only long enough to copy the counters.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

/// Prices per million tokens, plus the prompt-cache read discount.
///
/// Defaults match the Claude Sonnet pricing the engine was tuned against:
/// $3/MTok in, $15/MTok out, cache reads at 10% of the input rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_multiplier: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_multiplier: 0.10,
        }
    }
}

impl Pricing {
    /// Dollar cost of one service call's token usage.
    pub fn cost_usd(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_mtok
            + (usage.cached_tokens as f64 / 1_000_000.0)
                * self.input_per_mtok
                * self.cache_read_multiplier
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_mtok
    }
}

/// Monotonically growing usage counters for one process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    /// Cumulative tokens billed at the input rate
    pub input_tokens: u64,

    /// Cumulative tokens billed at the output rate
    pub output_tokens: u64,

    /// Cumulative tokens served from the provider's prompt cache
    pub cached_tokens: u64,

    /// Cumulative dollar cost
    pub cost_usd: f64,

    /// Units served from the local cache (or coalesced onto another call)
    pub cache_hits: u64,

    /// Units that required a paid service call
    pub fresh_calls: u64,
}

/// Thread-safe accumulator of token usage and dollar cost.
pub struct CostTracker {
    record: Mutex<CostRecord>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(CostRecord::default()),
        }
    }

    /// Record the usage and cost of one completed service call.
    ///
    /// Safe to call concurrently from every worker; deltas are applied under
    /// one lock so no update is lost.
    pub fn record_usage(&self, usage: &TokenUsage, cost_usd: f64) {
        let mut record = self.record.lock();
        record.input_tokens += usage.input_tokens;
        record.output_tokens += usage.output_tokens;
        record.cached_tokens += usage.cached_tokens;
        record.cost_usd += cost_usd;
        record.fresh_calls += 1;
    }

    /// Record a unit served from the cache. Adds zero token cost.
    pub fn record_cache_hit(&self) {
        self.record.lock().cache_hits += 1;
    }

    /// Consistent point-in-time copy of the counters.
    pub fn snapshot(&self) -> CostRecord {
        self.record.lock().clone()
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pricing_matches_hand_computed_cost() {
        let pricing = Pricing::default();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 200_000,
            cached_tokens: 500_000,
        };
        // 1M in at $3 + 0.2M out at $15 + 0.5M cached at $0.30
        let expected = 3.0 + 3.0 + 0.15;
        assert!((pricing.cost_usd(&usage) - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_usage_costs_nothing() {
        assert_eq!(Pricing::default().cost_usd(&TokenUsage::default()), 0.0);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let tracker = Arc::new(CostTracker::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    tracker.record_usage(
                        &TokenUsage {
                            input_tokens: 10,
                            output_tokens: 5,
                            cached_tokens: 1,
                        },
                        0.001,
                    );
                    tracker.record_cache_hit();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.input_tokens, 8_000);
        assert_eq!(snapshot.output_tokens, 4_000);
        assert_eq!(snapshot.cached_tokens, 800);
        assert_eq!(snapshot.fresh_calls, 800);
        assert_eq!(snapshot.cache_hits, 800);
        assert!((snapshot.cost_usd - 0.8).abs() < 1e-9);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let tracker = CostTracker::new();
        let before = tracker.snapshot();
        tracker.record_cache_hit();
        assert_eq!(before.cache_hits, 0);
        assert_eq!(tracker.snapshot().cache_hits, 1);
    }
}
