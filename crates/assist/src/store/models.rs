//! Conversation store data models.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// One conversation thread, keyed by session id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub assistant_id: String,
    pub session_id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Chat {
    /// Creation time, falling back to the epoch for unparseable rows.
    pub fn created(&self) -> DateTime<Utc> {
        parse_timestamp(&self.created_at)
    }
}

/// Parameters for creating a chat.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub user_id: String,
    pub assistant_id: String,
    pub session_id: String,
    pub title: Option<String>,
}

/// A stored chat message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    /// Position within the chat, starting at 1.
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub is_ocr: bool,
    pub created_at: String,
}

impl Message {
    pub fn created(&self) -> DateTime<Utc> {
        parse_timestamp(&self.created_at)
    }
}

/// Parameters for appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: String,
    pub role: MessageRole,
    pub content: String,
    pub is_ocr: bool,
}

/// A file attached to a user message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub id: String,
    pub message_id: String,
    pub original_file_name: String,
    pub stored_file_name: String,
    pub destination: String,
    pub created_at: String,
}

/// Parameters for recording an upload. The message id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub original_file_name: String,
    pub stored_file_name: String,
    pub destination: String,
}

/// A user known to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

/// Assistant catalogue entry as seen by the store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRecord {
    pub id: String,
    pub code: String,
    pub display_name: String,
    pub enabled: bool,
    pub first_reply_is_document: bool,
}

/// A chat joined with its owner and every stored message, for export.
#[derive(Debug, Clone)]
pub struct ExportChat {
    pub chat: Chat,
    pub username: String,
    pub messages: Vec<Message>,
}

impl ExportChat {
    /// Chats with zero or one message are trivial and not exported.
    pub fn qualifies(&self) -> bool {
        self.messages.len() > 1
    }
}

/// Chats and sessions present when an export started, with the last message
/// of each chat at that point. Rendering and purging stay inside it.
#[derive(Debug, Clone, Default)]
pub struct ExportScope {
    chats: HashMap<String, i64>,
    sessions: Vec<String>,
}

impl ExportScope {
    pub fn new(chats: HashMap<String, i64>, sessions: Vec<String>) -> Self {
        Self { chats, sessions }
    }

    /// Highest message seq captured for a chat, if the chat is in scope.
    pub fn last_seq(&self, chat_id: &str) -> Option<i64> {
        self.chats.get(chat_id).copied()
    }

    pub fn chats(&self) -> impl Iterator<Item = (&str, i64)> {
        self.chats.iter().map(|(id, seq)| (id.as_str(), *seq))
    }

    pub fn sessions(&self) -> &[String] {
        &self.sessions
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty() && self.sessions.is_empty()
    }
}

/// Row counts per table, listed in purge order (children before parents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub uploads: u64,
    pub messages: u64,
    pub chats: u64,
    pub sessions: u64,
}

impl RecordCounts {
    pub fn is_empty(&self) -> bool {
        self.uploads == 0 && self.messages == 0 && self.chats == 0 && self.sessions == 0
    }
}

/// Current time in the storage format (RFC 3339, millisecond precision, UTC).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
