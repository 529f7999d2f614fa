//! Conversation store.
//!
//! Pure data access for chats, messages, uploads and sessions, plus the
//! user and assistant catalogues the history view and export join against.
//!
//! Chats own messages and messages own uploads. Deletion always goes
//! children first: uploads, messages, chats, sessions.

mod models;
mod repository;

pub use models::{
    AssistantRecord, Chat, ExportChat, ExportScope, Message, MessageRole, NewChat, NewMessage,
    NewUpload, RecordCounts, Upload, User, now_timestamp, parse_timestamp,
};
pub use repository::ConversationRepository;
