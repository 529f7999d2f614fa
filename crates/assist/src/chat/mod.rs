//! Streaming conversation orchestrator.
//!
//! A turn runs in two phases. [`ChatService::prepare`] validates the request
//! and ingests attachments without touching the store, so its errors can be
//! answered synchronously. [`ChatService::run_turn`] then binds the chat,
//! opens the upstream stream (retrying rate limits), records the user turn
//! and relays deltas to the client before recording the assistant reply.

mod frames;
mod retry;
mod service;

use std::time::Duration;

use thiserror::Error;

pub use frames::ChatFrame;
pub use retry::{RetryConfig, open_with_retry};
pub use service::{
    ChatRequest, ChatService, ChatSettings, DEFAULT_CONTEXT_INSTRUCTION, PreparedTurn, TurnOutcome,
    build_request,
};

use crate::llm::LlmError;

/// Errors raised while handling a chat turn.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown assistant: {0}")]
    UnknownAssistant(String),

    #[error(transparent)]
    Upstream(#[from] LlmError),

    #[error("upstream still rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("upstream did not accept the request within {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}
