//! Error taxonomy shared across the service.

use std::sync::OnceLock;

use regex::Regex;

/// Errors flowing between the pipeline, queue layer and workers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Retryable: 5xx, gateway failures, timeouts.
    #[error("transient error: {0}")]
    Transient(String),
    /// The upstream service asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Non-retryable 4xx; fatal for the job, not the run.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The run-cancel flag was observed.
    #[error("run cancelled")]
    Cancelled,
    /// KV store unreachable and fallback disabled.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    /// Programmer error or store contract violation.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short stable code, used when an error crosses a process boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Transient(_) => "transient",
            Error::RateLimited(_) => "rate_limited",
            Error::InvalidInput(_) => "invalid_input",
            Error::Cancelled => "cancelled",
            Error::QueueUnavailable(_) => "queue_unavailable",
            Error::Fatal(_) => "fatal",
        }
    }

    /// Rebuild from a `(code, message)` pair received off the wire.
    pub fn from_parts(code: &str, message: &str) -> Self {
        match code {
            "transient" => Error::Transient(message.to_string()),
            "rate_limited" => Error::RateLimited(message.to_string()),
            "invalid_input" => Error::InvalidInput(message.to_string()),
            "cancelled" => Error::Cancelled,
            "queue_unavailable" => Error::QueueUnavailable(message.to_string()),
            _ => Error::Fatal(message.to_string()),
        }
    }

    /// Whether the queue layer should spend another attempt on this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited(_))
    }

    /// Classify a bare error message from an upstream service.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            Error::RateLimited(message)
        } else if is_transient_message(&message) {
            Error::Transient(message)
        } else {
            Error::InvalidInput(message)
        }
    }
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|429|too.?many.?requests|quota|throttl|capacity")
            .unwrap_or_else(|e| panic!("invalid rate-limit pattern: {e}"))
    })
}

fn transient_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b5\d{2}\b|gateway|timed.?out|timeout|connection (reset|refused|closed)|unavailable")
            .unwrap_or_else(|e| panic!("invalid transient pattern: {e}"))
    })
}

/// Does this message look like an upstream rate limit?
pub fn is_rate_limit_message(message: &str) -> bool {
    rate_limit_re().is_match(message)
}

/// Does this message look like a retryable provider failure?
pub fn is_transient_message(message: &str) -> bool {
    transient_re().is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_patterns() {
        for msg in [
            "HTTP 429 returned",
            "Rate limit exceeded",
            "rate-limited by upstream",
            "Too Many Requests",
            "quota exhausted for project",
            "request throttled",
            "over capacity",
        ] {
            assert!(is_rate_limit_message(msg), "should match: {msg}");
        }
        assert!(!is_rate_limit_message("plain failure"));
    }

    #[test]
    fn transient_patterns() {
        for msg in [
            "upstream returned 502",
            "bad gateway",
            "request timed out",
            "connection reset by peer",
            "service unavailable",
        ] {
            assert!(is_transient_message(msg), "should match: {msg}");
        }
        assert!(!is_transient_message("invalid location parameter"));
    }

    #[test]
    fn classify_prefers_rate_limit_over_transient() {
        // "429" alone should never be treated as merely transient.
        let err = Error::classify("502 from gateway after 429 too many requests");
        assert!(matches!(err, Error::RateLimited(_)));
    }

    #[test]
    fn code_roundtrip() {
        let errors = [
            Error::Transient("a".to_string()),
            Error::RateLimited("b".to_string()),
            Error::InvalidInput("c".to_string()),
            Error::Cancelled,
            Error::QueueUnavailable("d".to_string()),
            Error::Fatal("e".to_string()),
        ];
        for err in errors {
            let rebuilt = Error::from_parts(err.code(), "msg");
            assert_eq!(rebuilt.code(), err.code());
        }
    }

    #[test]
    fn retryability() {
        assert!(Error::Transient("x".to_string()).is_retryable());
        assert!(Error::RateLimited("x".to_string()).is_retryable());
        assert!(!Error::InvalidInput("x".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Fatal("x".to_string()).is_retryable());
    }
}
