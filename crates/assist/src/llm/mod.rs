//! Upstream LLM client.
//!
//! Wraps the provider's streaming completion call. Rate limits are reported
//! as [`LlmError::RateLimited`] with the provider's reset hint; retrying is
//! the caller's decision.

mod client;
mod error;
mod types;

pub use client::{
    CompletionClient, EventStream, OpenAiResponsesClient, RATE_LIMIT_CODE, classify_status,
    parse_duration_hint, parse_reset_hint,
};
pub use error::{LlmError, LlmResult};
pub use types::{CompletionRequest, InputMessage, InputRole, StreamEvent, Tool};
