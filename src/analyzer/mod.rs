//! Analysis service abstraction.
//!
//! This module defines the [`AnalysisClient`] trait to abstract the paid
//! text-analysis service, enabling testability with mock implementations.
//! The production implementation lives in [`anthropic`].

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::AnalyzerError;
use crate::types::{DimensionScore, Review, TokenUsage};

pub mod anthropic;

pub use anthropic::{AnthropicClient, AnthropicConfig};

/// One unit of work as presented to the analysis service.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub location_id: String,
    pub location_name: String,
    pub reviews: Vec<Review>,
    pub dimensions: Vec<String>,
}

/// The service's judgment for one unit of work.
///
/// `dimension_scores` may cover fewer dimensions than were requested; the
/// orchestrator records what is present and flags the gap rather than
/// failing the unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResponse {
    pub dimension_scores: BTreeMap<String, DimensionScore>,
    pub usage: TokenUsage,
}

/// Trait for calling the analysis service.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Analyze one batch of reviews against the requested dimensions.
    ///
    /// # Errors
    /// - `Transient` - network failure, timeout, or retriable status
    /// - `QuotaExhausted` - billing/quota stop; the run must halt new dispatch
    /// - `Malformed` - the response could not be parsed
    async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisResponse, AnalyzerError>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Mock analysis client for testing.
///
/// Allows configuring predetermined responses per location without making
/// real service calls, and instruments an in-flight counter so tests can
/// verify the orchestrator's concurrency ceiling.
///
/// # Example
/// ```ignore
/// let mock = MockAnalysisClient::new();
/// mock.add_response("L1", Ok(response));
/// mock.set_latency(Duration::from_millis(100));
/// ```
#[derive(Clone, Default)]
pub struct MockAnalysisClient {
    responses: Arc<Mutex<std::collections::HashMap<String, Vec<MockResult>>>>,
    default_response: Arc<Mutex<Option<MockResult>>>,
    calls: Arc<Mutex<Vec<MockAnalysisCall>>>,
    latency: Arc<Mutex<Duration>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

type MockResult = std::result::Result<AnalysisResponse, AnalyzerError>;

/// Record of a call made to the mock client.
#[derive(Debug, Clone)]
pub struct MockAnalysisCall {
    pub location_id: String,
    pub review_count: usize,
    pub dimensions: Vec<String>,
}

impl MockAnalysisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a location. Multiple responses for the same
    /// location are returned in FIFO order.
    pub fn add_response(&self, location_id: &str, response: MockResult) {
        self.responses
            .lock()
            .entry(location_id.to_string())
            .or_default()
            .push(response);
    }

    /// Response returned when no per-location queue matches.
    pub fn set_default_response(&self, response: MockResult) {
        *self.default_response.lock() = Some(response);
    }

    /// Simulated service latency per call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn get_calls(&self) -> Vec<MockAnalysisCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls currently awaiting their simulated latency.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of calls ever simultaneously in flight.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AnalysisClient for MockAnalysisClient {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisResponse, AnalyzerError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockAnalysisCall {
            location_id: request.location_id.clone(),
            review_count: request.reviews.len(),
            dimensions: request.dimensions.clone(),
        });

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        {
            let mut responses = self.responses.lock();
            if let Some(queue) = responses.get_mut(&request.location_id) {
                if !queue.is_empty() {
                    return queue.remove(0);
                }
            }
        }

        if let Some(response) = self.default_response.lock().clone() {
            return response;
        }

        Err(AnalyzerError::Malformed(format!(
            "no mock response configured for location {}",
            request.location_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sentiment;

    fn sample_request(location_id: &str) -> AnalysisRequest {
        AnalysisRequest {
            location_id: location_id.to_string(),
            location_name: "Central".to_string(),
            reviews: vec![Review {
                author: "a".to_string(),
                rating: 4,
                text: "good coffee, friendly staff".to_string(),
                date: "2024-02-10".to_string(),
            }],
            dimensions: vec!["service_quality".to_string()],
        }
    }

    fn sample_response() -> AnalysisResponse {
        let mut scores = BTreeMap::new();
        scores.insert(
            "service_quality".to_string(),
            DimensionScore {
                score: Some(4.0),
                sentiment: Sentiment::Positive,
                themes: vec!["staff".to_string()],
                quotes: vec![],
            },
        );
        AnalysisResponse {
            dimension_scores: scores,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cached_tokens: 0,
            },
        }
    }

    #[tokio::test]
    async fn scripted_responses_are_fifo() {
        let mock = MockAnalysisClient::new();
        mock.add_response("L1", Ok(sample_response()));
        mock.add_response(
            "L1",
            Err(AnalyzerError::Transient("flaky".to_string())),
        );

        let request = sample_request("L1");
        assert!(mock.analyze(&request).await.is_ok());
        assert!(matches!(
            mock.analyze(&request).await,
            Err(AnalyzerError::Transient(_))
        ));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn unconfigured_location_is_an_error() {
        let mock = MockAnalysisClient::new();
        let result = mock.analyze(&sample_request("unknown")).await;
        assert!(matches!(result, Err(AnalyzerError::Malformed(_))));
    }

    #[tokio::test]
    async fn default_response_covers_all_locations() {
        let mock = MockAnalysisClient::new();
        mock.set_default_response(Ok(sample_response()));

        assert!(mock.analyze(&sample_request("L1")).await.is_ok());
        assert!(mock.analyze(&sample_request("L2")).await.is_ok());
        let calls = mock.get_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].review_count, 1);
    }
}
