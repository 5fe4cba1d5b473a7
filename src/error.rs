use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the analysis engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Cache storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Filesystem I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classes for a single call to the analysis service.
///
/// The orchestrator handles each class differently: transient errors are
/// retried with backoff, quota exhaustion halts new dispatch for the whole
/// run, and malformed responses fail the one unit without retrying (the
/// same payload would fail the same way and bill again).
///
/// Clonable because a coalesced result is shared with every waiter for the
/// same fingerprint.
#[derive(Debug, Clone, Error)]
pub enum AnalyzerError {
    /// Network failure, timeout, or retriable HTTP status (429/5xx/408)
    #[error("transient service error: {0}")]
    Transient(String),

    /// The service reports exhausted quota or billing credit
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// The response could not be parsed into dimension scores
    #[error("malformed response: {0}")]
    Malformed(String),
}
