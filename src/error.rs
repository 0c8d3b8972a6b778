use std::time::Duration;
use thiserror::Error;

/// Failure surfaced by the transport before any HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_body() || err.is_decode() {
            Self::Body(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Coarse classification of an [`ExecutionError`], used by
/// [`RetryPolicy`](crate::llm::RetryPolicy) to decide what gets retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidRequest,
    Transport,
    RateLimited,
    ServerError,
    AuthenticationFailed,
    Rejected,
    MalformedResponse,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("rate limit exceeded{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request cancelled")]
    Cancelled,
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(": retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::Transport(_) => FailureKind::Transport,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::ServerError { .. } => FailureKind::ServerError,
            Self::AuthenticationFailed(_) => FailureKind::AuthenticationFailed,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::MalformedResponse(_) => FailureKind::MalformedResponse,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config: {0}")]
    MissingRequired(String),

    #[error("invalid value for {0}")]
    InvalidValue(String),
}
