//! Failure taxonomy and retry policy for pipeline tasks.
//!
//! Per-task failures are plain values ([`TaskFailure`]) carrying a typed
//! [`FailureKind`]. Whether a failed attempt is retried is decided by the pure
//! function [`retry_decision`]; nothing unwinds through the worker pool.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use graham_common::ValidationError;

// ============================================================================
// Fatal Errors
// ============================================================================

/// Errors that stop the pipeline before any task is dispatched.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration rejected at startup
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ValidationError),

    /// A component could not be constructed
    #[error("Failed to initialize {component}: {reason}")]
    Init { component: &'static str, reason: String },
}

// ============================================================================
// Failure Kinds
// ============================================================================

/// Classification of a failed task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout or connection failure on the way to the source
    NetworkError,
    /// No active relay was available when the attempt started
    ProxyExhausted,
    /// The source itself throttled us (HTTP 429)
    RateLimited,
    /// The source answered with a non-success status
    HttpStatus(u16),
    /// The payload could not be decoded into a record
    ParseError,
    /// The record decoded but holds values the engine cannot use
    InvalidFinancialInput,
    /// A field required by every valuation model is missing
    ValuationModelError,
    /// The batch was cancelled before this task finished
    Cancelled,
    /// The handler panicked
    Internal,
}

impl FailureKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        match self {
            Self::NetworkError | Self::ProxyExhausted | Self::RateLimited => true,
            Self::HttpStatus(code) => is_retryable_status(code),
            Self::ParseError
            | Self::InvalidFinancialInput
            | Self::ValuationModelError
            | Self::Cancelled
            | Self::Internal => false,
        }
    }
}

/// 403 is the usual anti-scraping answer; a fresh relay often clears it.
fn is_retryable_status(code: u16) -> bool {
    matches!(code, 403 | 408 | 429) || (500..600).contains(&code)
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkError => write!(f, "network error"),
            Self::ProxyExhausted => write!(f, "proxy pool exhausted"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::HttpStatus(code) => write!(f, "HTTP status {}", code),
            Self::ParseError => write!(f, "parse error"),
            Self::InvalidFinancialInput => write!(f, "invalid financial input"),
            Self::ValuationModelError => write!(f, "valuation model error"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

// ============================================================================
// Task Failure
// ============================================================================

/// One failed attempt: the kind drives retry policy, the detail is for humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "batch cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for TaskFailure {}

// ============================================================================
// Retry Policy
// ============================================================================

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue with backoff
    Retry,
    /// Record the failure as final
    GiveUp,
}

/// Decide whether attempt number `attempt` (1-based) should be followed by another.
pub fn retry_decision(kind: FailureKind, attempt: u32, max_attempts: u32) -> RetryDecision {
    if !kind.is_retryable() {
        return RetryDecision::GiveUp;
    }
    if attempt >= max_attempts {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(FailureKind::NetworkError, true)]
    #[test_case(FailureKind::ProxyExhausted, true)]
    #[test_case(FailureKind::RateLimited, true)]
    #[test_case(FailureKind::HttpStatus(503), true)]
    #[test_case(FailureKind::HttpStatus(429), true)]
    #[test_case(FailureKind::HttpStatus(403), true)]
    #[test_case(FailureKind::HttpStatus(404), false)]
    #[test_case(FailureKind::ParseError, false)]
    #[test_case(FailureKind::InvalidFinancialInput, false)]
    #[test_case(FailureKind::ValuationModelError, false)]
    #[test_case(FailureKind::Cancelled, false)]
    #[test_case(FailureKind::Internal, false)]
    fn test_retryable(kind: FailureKind, expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }

    #[test]
    fn test_retry_decision_respects_budget() {
        assert_eq!(retry_decision(FailureKind::NetworkError, 1, 3), RetryDecision::Retry);
        assert_eq!(retry_decision(FailureKind::NetworkError, 2, 3), RetryDecision::Retry);
        assert_eq!(retry_decision(FailureKind::NetworkError, 3, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_decision_non_retryable_gives_up_immediately() {
        assert_eq!(retry_decision(FailureKind::ParseError, 1, 5), RetryDecision::GiveUp);
        assert_eq!(
            retry_decision(FailureKind::HttpStatus(404), 1, 5),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_rate_limited_backs_off_within_budget() {
        assert_eq!(retry_decision(FailureKind::RateLimited, 1, 3), RetryDecision::Retry);
        assert_eq!(retry_decision(FailureKind::RateLimited, 3, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_failure_display() {
        let failure = TaskFailure::new(FailureKind::HttpStatus(502), "bad gateway");
        assert_eq!(failure.to_string(), "HTTP status 502: bad gateway");
    }

    #[test]
    fn test_failure_kind_serde_shape() {
        let json = serde_json::to_string(&FailureKind::HttpStatus(404)).unwrap();
        assert_eq!(json, r#"{"kind":"http_status","code":404}"#);
        let json = serde_json::to_string(&FailureKind::ParseError).unwrap();
        assert_eq!(json, r#"{"kind":"parse_error"}"#);
    }
}
