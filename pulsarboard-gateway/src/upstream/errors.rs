use std::time::Duration;
use thiserror::Error;

/// Failure of one upstream call after retries and breaker checks.
///
/// `Clone` because a single coalesced load hands the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("upstream timeout")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("circuit open for {target}, retry after {}s", retry_after.as_secs())]
    CircuitOpen { target: String, retry_after: Duration },

    #[error("upstream rejected request with {status}: {message}")]
    ClientError { status: u16, message: String },

    #[error("upstream refused credentials ({status})")]
    Unauthorized { status: u16 },

    #[error("unable to decode upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Timeout | UpstreamError::Unavailable(_))
    }

    /// Failures that the read path may mask with an older value.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            UpstreamError::Timeout | UpstreamError::Unavailable(_) | UpstreamError::CircuitOpen { .. }
        )
    }

    /// Suggested wait before the caller tries again, for 503 responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            UpstreamError::Timeout | UpstreamError::Unavailable(_) => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Unavailable(_) => "unavailable",
            UpstreamError::CircuitOpen { .. } => "circuit_open",
            UpstreamError::ClientError { .. } => "client_error",
            UpstreamError::Unauthorized { .. } => "unauthorized",
            UpstreamError::Decode(_) => "decode",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamError::ClientError { status: 404, .. })
    }
}

/// Raw failure reported by a [`Transport`](super::Transport) before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("credential unavailable: {0}")]
    Credential(String),
}
