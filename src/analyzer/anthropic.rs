//! Production analysis client backed by an Anthropic-style messages API.
//!
//! The system prompt is sent with an ephemeral cache marker so repeated calls
//! within a run bill the static instructions at the cache-read rate. The
//! model is instructed to answer with a single JSON object mapping each
//! requested dimension to its judgment; extraction tolerates the usual model
//! quirks (markdown fences, doubled braces, leading prose).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AnalyzerError;
use crate::types::{DimensionScore, Sentiment, TokenUsage};

use super::{AnalysisClient, AnalysisRequest, AnalysisResponse};

const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You are a customer-review analyst. You will be given a batch of reviews \
for one business location and a list of analysis dimensions. For each requested dimension, judge the \
batch as a whole and respond with a single JSON object of the form \
{\"<dimension>\": {\"score\": <number 1-5 or \"N/A\">, \"sentiment\": \"positive\"|\"negative\"|\"mixed\", \
\"themes\": [<strings>], \"quotes\": [<short verbatim excerpts>]}}. \
Use \"N/A\" for a dimension the reviews say nothing about. Respond with the JSON object only.";

/// Configuration for [`AnthropicClient`].
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// API key, sent in the x-api-key header
    pub api_key: String,

    /// Model name (e.g. "claude-sonnet-4-20250514")
    pub model: String,

    /// Base URL of the service
    pub endpoint: String,

    /// Maximum output tokens per call
    pub max_tokens: u32,

    /// Timeout for each individual request attempt in milliseconds
    pub timeout_ms: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".to_string(),
            endpoint: "https://api.anthropic.com".to_string(),
            max_tokens: 1000,
            timeout_ms: 120_000,
        }
    }
}

/// Analysis client using the Anthropic messages API over reqwest.
#[derive(Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn build_user_content(request: &AnalysisRequest) -> String {
        let mut content = format!(
            "Location: {} ({})\n\nReviews:\n",
            request.location_name, request.location_id
        );
        for review in &request.reviews {
            content.push_str(&format!(
                "- [{}/5] {} ({}): {}\n",
                review.rating, review.author, review.date, review.text
            ));
        }
        content.push_str("\nDimensions to judge: ");
        content.push_str(&request.dimensions.join(", "));
        content
    }

    fn build_body(&self, request: &AnalysisRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": [{
                "type": "text",
                "text": SYSTEM_PROMPT,
                "cache_control": {"type": "ephemeral"},
            }],
            "messages": [{
                "role": "user",
                "content": Self::build_user_content(request),
            }],
        })
    }
}

#[async_trait]
impl AnalysisClient for AnthropicClient {
    #[tracing::instrument(skip(self, request), fields(location_id = %request.location_id, reviews = request.reviews.len()))]
    async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisResponse, AnalyzerError> {
        let url = format!("{}/v1/messages", self.config.endpoint);

        tracing::debug!(url = %url, "Dispatching analysis call");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| AnalyzerError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AnalyzerError::Transient(e.to_string()))?;

        if !(200..300).contains(&status) {
            let error = classify_failure(status, &body);
            tracing::warn!(status, error = %error, "Analysis call failed");
            return Err(error);
        }

        let parsed = parse_service_response(&body, &request.dimensions)?;
        tracing::info!(
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            cached_tokens = parsed.usage.cached_tokens,
            dimensions = parsed.dimension_scores.len(),
            "Analysis call completed"
        );
        Ok(parsed)
    }
}

/// Map a non-success HTTP response to an error class.
///
/// Quota/billing exhaustion is detected by body content rather than status:
/// the provider reports depleted credit as a 400 and hard rate/quota stops as
/// a 429, and only the body distinguishes "slow down" from "stop paying".
pub(crate) fn classify_failure(status: u16, body: &str) -> AnalyzerError {
    let lowered = body.to_lowercase();
    if lowered.contains("credit balance")
        || lowered.contains("insufficient_quota")
        || lowered.contains("billing")
    {
        return AnalyzerError::QuotaExhausted(format!("HTTP {status}: {body}"));
    }
    if status == 429 || status == 408 || status >= 500 {
        return AnalyzerError::Transient(format!("HTTP {status}"));
    }
    AnalyzerError::Malformed(format!("unexpected HTTP {status}: {body}"))
}

/// Parse the full service response body into scores plus usage.
pub(crate) fn parse_service_response(
    body: &str,
    requested_dimensions: &[String],
) -> std::result::Result<AnalysisResponse, AnalyzerError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AnalyzerError::Malformed(format!("response body is not JSON: {e}")))?;

    let text = value["content"][0]["text"]
        .as_str()
        .ok_or_else(|| AnalyzerError::Malformed("response has no text content".to_string()))?;

    let usage = TokenUsage {
        input_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        cached_tokens: value["usage"]["cache_read_input_tokens"]
            .as_u64()
            .unwrap_or(0),
    };

    let raw_scores = extract_json(text)?;

    let mut dimension_scores = BTreeMap::new();
    for dimension in requested_dimensions {
        if let Some(raw) = raw_scores.get(dimension) {
            if let Some(score) = parse_dimension(raw) {
                dimension_scores.insert(dimension.clone(), score);
            }
        }
    }

    if dimension_scores.is_empty() && !requested_dimensions.is_empty() {
        return Err(AnalyzerError::Malformed(
            "model output covered none of the requested dimensions".to_string(),
        ));
    }

    Ok(AnalysisResponse {
        dimension_scores,
        usage,
    })
}

/// Extract the JSON object from the model's text output.
///
/// Models sometimes wrap the object in markdown fences, prepend prose, or
/// copy doubled braces from the prompt's schema example.
pub(crate) fn extract_json(
    text: &str,
) -> std::result::Result<serde_json::Map<String, serde_json::Value>, AnalyzerError> {
    let cleaned = text.trim().replace("{{", "{").replace("}}", "}");

    let candidate = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => cleaned[start..=end].to_string(),
        _ => cleaned
            .replace("```json", "")
            .replace("```", "")
            .trim()
            .to_string(),
    };

    match serde_json::from_str::<serde_json::Value>(&candidate) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(AnalyzerError::Malformed(
            "model output is not a JSON object".to_string(),
        )),
        Err(e) => Err(AnalyzerError::Malformed(format!(
            "model output is not parseable JSON: {e}"
        ))),
    }
}

/// Decode one dimension's judgment, tolerating "N/A" and absent fields.
pub(crate) fn parse_dimension(value: &serde_json::Value) -> Option<DimensionScore> {
    let object = value.as_object()?;

    let score = match object.get("score") {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        // "N/A", null, or absent all mean not-applicable
        _ => None,
    };

    let sentiment = match object.get("sentiment").and_then(|s| s.as_str()) {
        Some("positive") => Sentiment::Positive,
        Some("negative") => Sentiment::Negative,
        _ => Sentiment::Mixed,
    };

    let string_list = |key: &str| -> Vec<String> {
        object
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };

    Some(DimensionScore {
        score,
        sentiment,
        themes: string_list("themes"),
        quotes: string_list("quotes"),
    })
}
