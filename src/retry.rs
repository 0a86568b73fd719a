//! Per-attempt fetch errors, their classification, and the backoff policy
//! applied between attempts of a single chunk or probe.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Error from one attempt at a network operation. Classified before the
/// retry loop decides whether to try again.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("server ignored the byte range request (HTTP {0})")]
    RangeIgnored(StatusCode),
    #[error("server answered with the wrong byte range: wanted offset {expected}, got {}", .actual.map_or("none".to_string(), |a| a.to_string()))]
    RangeMismatch { expected: u64, actual: Option<u64> },
    #[error("connection closed early: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    #[error("invalid request header {0}")]
    InvalidHeader(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// High-level classification of an error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    /// Server asked us to slow down (429, 503).
    Throttled,
    /// Connection refused/reset, DNS, truncated body.
    Connection,
    Http5xx(u16),
    /// Anything else; not retried.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with caps.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `attempt` is 1-based (1 = first attempt).
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            ErrorKind::Other => RetryDecision::NoRetry,
            ErrorKind::Timeout
            | ErrorKind::Connection
            | ErrorKind::Throttled
            | ErrorKind::Http5xx(_) => {
                let exp = 1u32 << attempt.saturating_sub(1).min(8);
                let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

pub fn classify_http_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 | 503 => ErrorKind::Throttled,
        code @ 500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Other,
    }
}

pub fn classify(e: &FetchError) -> ErrorKind {
    match e {
        FetchError::Network(err) => {
            if err.is_timeout() {
                ErrorKind::Timeout
            } else if let Some(status) = err.status() {
                classify_http_status(status)
            } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
                ErrorKind::Connection
            } else {
                ErrorKind::Other
            }
        }
        FetchError::Status(status) => classify_http_status(*status),
        FetchError::PartialTransfer { .. } => ErrorKind::Connection,
        FetchError::RangeIgnored(_)
        | FetchError::RangeMismatch { .. }
        | FetchError::InvalidHeader(_)
        | FetchError::Storage(_) => ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_for_other() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Other), RetryDecision::NoRetry);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let p = RetryPolicy { max_attempts: 20, ..RetryPolicy::default() };
        let delay = |attempt| match p.decide(attempt, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            RetryDecision::NoRetry => panic!("expected retry"),
        };
        assert_eq!(delay(1), Duration::from_millis(250));
        assert_eq!(delay(2), Duration::from_millis(500));
        assert!(delay(12) <= p.max_delay);
    }

    #[test]
    fn respects_max_attempts() {
        let p = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        assert!(matches!(p.decide(1, ErrorKind::Throttled), RetryDecision::RetryAfter(_)));
        assert!(matches!(p.decide(2, ErrorKind::Connection), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_http_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::Throttled);
        assert_eq!(classify_http_status(StatusCode::SERVICE_UNAVAILABLE), ErrorKind::Throttled);
        assert_eq!(classify_http_status(StatusCode::BAD_GATEWAY), ErrorKind::Http5xx(502));
        assert_eq!(classify_http_status(StatusCode::NOT_FOUND), ErrorKind::Other);
    }

    #[test]
    fn truncated_body_is_retryable_and_disk_errors_are_not() {
        let short = FetchError::PartialTransfer { expected: 10, received: 4 };
        assert_eq!(classify(&short), ErrorKind::Connection);
        let disk = FetchError::Storage(std::io::Error::other("disk full"));
        assert_eq!(classify(&disk), ErrorKind::Other);
    }
}
