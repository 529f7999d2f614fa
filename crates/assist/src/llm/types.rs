//! Request and event types for the streaming completion API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::LlmError;

/// Role of an input message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: InputRole,
    pub content: String,
}

impl InputMessage {
    pub fn new(role: InputRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Tools the model may call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
    FileSearch { vector_store_ids: Vec<String> },
}

/// Body of a streaming `/responses` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input: Vec<InputMessage>,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

/// A decoded upstream stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental output text.
    TextDelta(String),
    /// The response finished.
    Completed,
    /// The provider reported an error inside the stream.
    Error(String),
    /// Anything else (lifecycle notifications, tool progress).
    Other,
}

impl StreamEvent {
    /// Decode one SSE `data:` payload.
    ///
    /// Payloads that are not JSON are logged and skipped as [`StreamEvent::Other`];
    /// a text delta without its text is an error.
    pub fn from_data(data: &str) -> Result<Self, LlmError> {
        let parsed: Value = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, payload = %data, "Skipping undecodable stream event");
                return Ok(StreamEvent::Other);
            }
        };

        let event_type = parsed.get("type").and_then(Value::as_str).unwrap_or_default();
        let event = match event_type {
            "response.output_text.delta" => {
                let delta = parsed
                    .get("delta")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LlmError::Parse("text delta without 'delta'".to_string()))?;
                StreamEvent::TextDelta(delta.to_string())
            }
            "response.completed" => StreamEvent::Completed,
            "error" => StreamEvent::Error(error_message(&parsed)),
            "response.failed" => StreamEvent::Error(
                parsed
                    .pointer("/response/error")
                    .map(error_message)
                    .unwrap_or_else(|| "response failed".to_string()),
            ),
            _ => StreamEvent::Other,
        };
        Ok(event)
    }
}

/// Pull a human-readable message out of an error object.
fn error_message(value: &Value) -> String {
    value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/error/message").and_then(Value::as_str))
        .or_else(|| value.get("code").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Error body returned with non-success statuses.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}
