//! Upstream LLM client error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for upstream LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors raised by the completion client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider refused the call because a rate limit was hit.
    #[error("rate limit exceeded")]
    RateLimited { reset_hint: Option<Duration> },

    /// The provider answered with an error status or an error payload.
    #[error("upstream error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    /// Connection or transport failure.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// A stream event could not be decoded.
    #[error("failed to parse upstream event: {0}")]
    Parse(String),
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Transport(err.to_string())
    }
}
