//! Frames pushed to chat clients.

use serde::{Deserialize, Serialize};

/// One push-channel frame: `{delta}`, `{done: true}` or `{error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatFrame {
    Delta { delta: String },
    Done { done: bool },
    Error { error: String },
}

impl ChatFrame {
    pub fn delta(text: impl Into<String>) -> Self {
        ChatFrame::Delta { delta: text.into() }
    }

    pub fn done() -> Self {
        ChatFrame::Done { done: true }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ChatFrame::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ChatFrame::Error { .. })
    }

    pub fn to_json(&self) -> String {
        // Serializing plain string fields cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"encoding failed"}"#.to_string())
    }
}
