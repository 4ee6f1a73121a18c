//! Error taxonomy for the orchestration core.
//!
//! One variant per failure class named in the spec's error-handling design:
//! retriable transport/timeout/rate-limit errors, terminal input/quota/
//! response errors, and the two control-flow signals (`CircuitOpen`,
//! `Cancelled`) that callers need to distinguish from ordinary failures.

use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds shared by the LLM core and the diagram cache.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-supplied input was invalid: empty prompt, unknown logical
    /// model, oversize payload. Never retried.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// DNS failure, connection refused, TLS error. Retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Per-attempt or overall timeout elapsed.
    #[error("operation timed out after {0}s")]
    Timeout(u64),

    /// Upstream returned 429 or an equivalent signal.
    #[error("rate limited upstream: {0}")]
    RateLimited(String),

    /// Upstream reported quota exhaustion. Not retried; flips the circuit
    /// breaker toward open faster than a generic failure.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Empty body or unparseable JSON where JSON was required.
    #[error("invalid response: {0}")]
    ResponseInvalid(String),

    /// Upstream returned a 5xx status: the request reached the provider but
    /// the provider itself failed. Retried, and distinct from `Transport`
    /// (which never reached a server at all) so health checks can tell a
    /// dead provider from a dead connection.
    #[error("service error {0}: {1}")]
    ServiceUnavailable(u16, String),

    /// The selected route is circuit-broken; the caller never reached the
    /// provider.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// The caller abandoned the request. Counted as a failure for metrics
    /// but does not trip the breaker.
    #[error("request cancelled")]
    Cancelled,

    /// The requested logical or physical model has no registered client.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Serialization/deserialization failure that isn't a response-shape
    /// problem from an upstream provider (e.g. local JSON encoding).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for errors that don't fit another category, preserved so
    /// operators still get full context while callers only see a stable
    /// kind.
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the retry policy should retry this error category.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_)
                | CoreError::Timeout(_)
                | CoreError::RateLimited(_)
                | CoreError::ServiceUnavailable(_, _)
        )
    }

    /// Stable, sanitized error kind string safe to hand back to a client.
    /// Upstream error text is never echoed verbatim; callers that need the
    /// raw message should consult logs instead.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InputInvalid(_) => "input_invalid",
            CoreError::Transport(_) => "transport",
            CoreError::Timeout(_) => "timeout",
            CoreError::RateLimited(_) => "rate_limit",
            CoreError::QuotaExhausted(_) => "quota_exhausted",
            CoreError::ResponseInvalid(_) => "response_invalid",
            CoreError::ServiceUnavailable(_, _) => "service_unavailable",
            CoreError::CircuitOpen(_) => "circuit_open",
            CoreError::Cancelled => "cancelled",
            CoreError::UnknownModel(_) => "unknown_model",
            CoreError::Serialization(_) => "serialization",
            CoreError::Other(_) => "unknown",
        }
    }
}

/// Error categories surfaced by `LLMCore::health_check` (§4.6.8). Kept
/// distinct from `CoreError` because health-check callers want a closed
/// enum they can match exhaustively without leaking upstream text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthErrorCategory {
    DnsError,
    ConnectionError,
    Timeout,
    RateLimit,
    QuotaExhausted,
    ServiceError,
    Unknown,
}

/// Classify a core error into the health-check category table (SPEC_FULL §C.6).
pub fn classify_error(err: &CoreError) -> HealthErrorCategory {
    match err {
        CoreError::Transport(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("dns") || lower.contains("resolve") {
                HealthErrorCategory::DnsError
            } else {
                HealthErrorCategory::ConnectionError
            }
        }
        CoreError::Timeout(_) => HealthErrorCategory::Timeout,
        CoreError::RateLimited(_) => HealthErrorCategory::RateLimit,
        CoreError::QuotaExhausted(_) => HealthErrorCategory::QuotaExhausted,
        CoreError::ResponseInvalid(_) => HealthErrorCategory::ServiceError,
        CoreError::ServiceUnavailable(_, _) => HealthErrorCategory::ServiceError,
        _ => HealthErrorCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_categories() {
        assert!(CoreError::Transport("x".into()).is_retriable());
        assert!(CoreError::Timeout(5).is_retriable());
        assert!(CoreError::RateLimited("x".into()).is_retriable());
        assert!(!CoreError::QuotaExhausted("x".into()).is_retriable());
        assert!(!CoreError::InputInvalid("x".into()).is_retriable());
    }

    #[test]
    fn classify_dns_vs_connection() {
        let dns = CoreError::Transport("dns resolution failed".into());
        assert_eq!(classify_error(&dns), HealthErrorCategory::DnsError);

        let conn = CoreError::Transport("connection refused".into());
        assert_eq!(classify_error(&conn), HealthErrorCategory::ConnectionError);
    }

    #[test]
    fn classify_5xx_as_service_error() {
        let err = CoreError::ServiceUnavailable(503, "upstream overloaded".into());
        assert_eq!(classify_error(&err), HealthErrorCategory::ServiceError);
        assert!(err.is_retriable());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(CoreError::Cancelled.kind(), "cancelled");
        assert_eq!(CoreError::QuotaExhausted("x".into()).kind(), "quota_exhausted");
    }
}
