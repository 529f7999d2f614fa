//! Repository for conversation store operations.

use anyhow::{Context, Result, anyhow};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::models::{
    AssistantRecord, Chat, ExportChat, ExportScope, Message, NewChat, NewMessage, NewUpload,
    RecordCounts, Upload, User, now_timestamp,
};

const CHAT_COLUMNS: &str = "id, user_id, assistant_id, session_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, seq, role, content, is_ocr, created_at";
const UPLOAD_COLUMNS: &str =
    "id, message_id, original_file_name, stored_file_name, destination, created_at";

#[derive(FromRow)]
struct ExportChatRow {
    #[sqlx(flatten)]
    chat: Chat,
    username: String,
}

/// Repository for chats, messages, uploads, sessions, users and assistants.
#[derive(Debug, Clone)]
pub struct ConversationRepository {
    pool: SqlitePool,
}

impl ConversationRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========== Chat Operations ==========

    /// Find the chat bound to a session id.
    pub async fn find_chat_by_session(&self, session_id: &str) -> Result<Option<Chat>> {
        sqlx::query_as::<_, Chat>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching chat by session")
    }

    /// Get a chat by id.
    pub async fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        sqlx::query_as::<_, Chat>(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching chat")
    }

    /// Return the chat for `session_id`, creating it if absent.
    ///
    /// The insert and the uniqueness check are one statement, so concurrent
    /// callers for the same session always observe the same row.
    pub async fn get_or_create_chat(&self, chat: NewChat) -> Result<Chat> {
        let now = now_timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, assistant_id, session_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&chat.user_id)
        .bind(&chat.assistant_id)
        .bind(&chat.session_id)
        .bind(&chat.title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("inserting chat")?;

        if result.rows_affected() > 0 {
            tracing::debug!(session_id = %chat.session_id, "Created chat");
        }

        self.find_chat_by_session(&chat.session_id)
            .await?
            .ok_or_else(|| anyhow!("chat for session {} not found after insert", chat.session_id))
    }

    /// Update the title of the chat bound to `session_id`.
    pub async fn update_chat_title(&self, session_id: &str, title: &str) -> Result<Option<Chat>> {
        let result = sqlx::query("UPDATE chats SET title = ?, updated_at = ? WHERE session_id = ?")
            .bind(title)
            .bind(now_timestamp())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("updating chat title")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_chat_by_session(session_id).await
    }

    /// List chats, optionally filtered by owner and assistant, newest first.
    pub async fn list_chats(
        &self,
        user_id: Option<&str>,
        assistant_id: Option<&str>,
    ) -> Result<Vec<Chat>> {
        sqlx::query_as::<_, Chat>(&format!(
            r#"
            SELECT {CHAT_COLUMNS}
            FROM chats
            WHERE (?1 IS NULL OR user_id = ?1)
              AND (?2 IS NULL OR assistant_id = ?2)
            ORDER BY updated_at DESC, id
            "#
        ))
        .bind(user_id)
        .bind(assistant_id)
        .fetch_all(&self.pool)
        .await
        .context("listing chats")
    }

    // ========== Message Operations ==========

    /// List a chat's messages oldest first.
    ///
    /// OCR-derived messages are only returned when `include_ocr` is set.
    pub async fn list_messages(&self, chat_id: &str, include_ocr: bool) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE chat_id = ? AND (? OR is_ocr = 0)
            ORDER BY seq ASC
            "#
        ))
        .bind(chat_id)
        .bind(include_ocr)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")
    }

    /// Count every message in a chat, OCR-derived ones included.
    pub async fn count_messages(&self, chat_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .context("counting messages")
    }

    /// Append a message to a chat.
    pub async fn append_message(&self, message: NewMessage) -> Result<Message> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        insert_message(&mut conn, &message).await
    }

    /// Write a user message and its uploads in one transaction.
    ///
    /// Either the message and every upload exist afterwards, or none do.
    pub async fn record_user_turn(
        &self,
        message: NewMessage,
        uploads: Vec<NewUpload>,
    ) -> Result<(Message, Vec<Upload>)> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let stored = insert_message(&mut tx, &message).await?;
        let mut recorded = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            recorded.push(insert_upload(&mut tx, &stored.id, upload).await?);
        }

        tx.commit().await.context("committing user turn")?;
        Ok((stored, recorded))
    }

    /// User messages that are the last message of their chat, i.e. exchanges
    /// whose assistant reply was never recorded.
    pub async fn find_unanswered_messages(&self) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT m.id, m.chat_id, m.seq, m.role, m.content, m.is_ocr, m.created_at
            FROM messages m
            WHERE m.role = 'user'
              AND m.seq = (SELECT MAX(seq) FROM messages WHERE chat_id = m.chat_id)
            ORDER BY m.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("finding unanswered messages")
    }

    // ========== Upload Operations ==========

    /// Record an upload for an existing message.
    pub async fn record_upload(&self, message_id: &str, upload: NewUpload) -> Result<Upload> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        insert_upload(&mut conn, message_id, &upload).await
    }

    /// List the uploads attached to a message.
    pub async fn list_uploads(&self, message_id: &str) -> Result<Vec<Upload>> {
        sqlx::query_as::<_, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE message_id = ? ORDER BY created_at, id"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .context("listing uploads")
    }

    // ========== Session Operations ==========

    /// Register a session or refresh its last-seen time.
    pub async fn touch_session(&self, session_id: &str, user_id: &str) -> Result<()> {
        let now = now_timestamp();
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, created_at, last_seen_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("touching session")?;
        Ok(())
    }

    // ========== User Operations ==========

    /// Insert or update a user.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, role) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET username = excluded.username, role = excluded.role
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.role)
        .execute(&self.pool)
        .await
        .context("upserting user")?;
        Ok(())
    }

    /// Register a user seen for the first time with the default role.
    ///
    /// Existing rows are left untouched so synced names and roles survive.
    pub async fn ensure_user(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, role) VALUES (?, ?, 'user')
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("ensuring user")?;
        Ok(())
    }

    /// Get a user by id.
    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT id, username, role FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching user")
    }

    // ========== Assistant Operations ==========

    /// Insert or update an assistant catalogue entry.
    pub async fn upsert_assistant(&self, assistant: &AssistantRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assistants (id, code, display_name, enabled, first_reply_is_document)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                code = excluded.code,
                display_name = excluded.display_name,
                enabled = excluded.enabled,
                first_reply_is_document = excluded.first_reply_is_document
            "#,
        )
        .bind(&assistant.id)
        .bind(&assistant.code)
        .bind(&assistant.display_name)
        .bind(assistant.enabled)
        .bind(assistant.first_reply_is_document)
        .execute(&self.pool)
        .await
        .context("upserting assistant")?;
        Ok(())
    }

    /// List assistants that take part in exports, ordered by code.
    pub async fn list_enabled_assistants(&self) -> Result<Vec<AssistantRecord>> {
        sqlx::query_as::<_, AssistantRecord>(
            r#"
            SELECT id, code, display_name, enabled, first_reply_is_document
            FROM assistants
            WHERE enabled = 1
            ORDER BY code, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing enabled assistants")
    }

    /// Get an assistant catalogue entry.
    pub async fn get_assistant(&self, id: &str) -> Result<Option<AssistantRecord>> {
        sqlx::query_as::<_, AssistantRecord>(
            "SELECT id, code, display_name, enabled, first_reply_is_document FROM assistants WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching assistant")
    }

    // ========== Export Operations ==========

    /// Every chat of an assistant joined with its owner's username and all of
    /// its messages (OCR-derived ones included), oldest chat first.
    pub async fn list_export_chats(&self, assistant_id: &str) -> Result<Vec<ExportChat>> {
        let rows = sqlx::query_as::<_, ExportChatRow>(
            r#"
            SELECT c.id, c.user_id, c.assistant_id, c.session_id, c.title,
                   c.created_at, c.updated_at,
                   COALESCE(u.username, c.user_id) AS username
            FROM chats c
            LEFT JOIN users u ON u.id = c.user_id
            WHERE c.assistant_id = ?
            ORDER BY c.created_at ASC, c.id ASC
            "#,
        )
        .bind(assistant_id)
        .fetch_all(&self.pool)
        .await
        .context("listing chats for export")?;

        let mut chats = Vec::with_capacity(rows.len());
        for row in rows {
            let messages = self.list_messages(&row.chat.id, true).await?;
            chats.push(ExportChat {
                chat: row.chat,
                username: row.username,
                messages,
            });
        }
        Ok(chats)
    }

    /// Row counts of the purgeable tables.
    pub async fn record_counts(&self) -> Result<RecordCounts> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(&pool)
                    .await
                    .with_context(|| format!("counting {table}"))
            }
        };

        Ok(RecordCounts {
            uploads: count("uploads").await? as u64,
            messages: count("messages").await? as u64,
            chats: count("chats").await? as u64,
            sessions: count("sessions").await? as u64,
        })
    }

    /// Capture every chat (with its current last message) and session.
    pub async fn snapshot_export_scope(&self) -> Result<ExportScope> {
        let mut tx = self.pool.begin().await.context("starting scope snapshot")?;

        let chats = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT c.id, COALESCE(MAX(m.seq), 0)
            FROM chats c
            LEFT JOIN messages m ON m.chat_id = c.id
            GROUP BY c.id
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .context("snapshotting chats")?;
        let sessions = sqlx::query_scalar::<_, String>("SELECT session_id FROM sessions")
            .fetch_all(&mut *tx)
            .await
            .context("snapshotting sessions")?;

        tx.commit().await.context("finishing scope snapshot")?;
        Ok(ExportScope::new(chats.into_iter().collect(), sessions))
    }

    /// Delete the uploads, messages, chats and sessions captured in `scope`,
    /// in that order.
    ///
    /// Messages appended after the snapshot survive, and so do their chat
    /// and session. Rows created after the snapshot are never touched.
    pub async fn purge_scope(&self, scope: &ExportScope) -> Result<RecordCounts> {
        let mut tx = self.pool.begin().await.context("starting purge transaction")?;
        let mut counts = RecordCounts::default();

        for (chat_id, last_seq) in scope.chats() {
            counts.uploads += sqlx::query(
                r#"
                DELETE FROM uploads WHERE message_id IN
                    (SELECT id FROM messages WHERE chat_id = ? AND seq <= ?)
                "#,
            )
            .bind(chat_id)
            .bind(last_seq)
            .execute(&mut *tx)
            .await
            .context("deleting uploads")?
            .rows_affected();
        }
        for (chat_id, last_seq) in scope.chats() {
            counts.messages += sqlx::query("DELETE FROM messages WHERE chat_id = ? AND seq <= ?")
                .bind(chat_id)
                .bind(last_seq)
                .execute(&mut *tx)
                .await
                .context("deleting messages")?
                .rows_affected();
        }
        for (chat_id, _) in scope.chats() {
            counts.chats += sqlx::query(
                "DELETE FROM chats WHERE id = ? AND NOT EXISTS (SELECT 1 FROM messages WHERE chat_id = ?)",
            )
            .bind(chat_id)
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .context("deleting chats")?
            .rows_affected();
        }
        for session_id in scope.sessions() {
            counts.sessions += sqlx::query(
                "DELETE FROM sessions WHERE session_id = ? AND NOT EXISTS (SELECT 1 FROM chats WHERE session_id = ?)",
            )
            .bind(session_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .context("deleting sessions")?
            .rows_affected();
        }

        tx.commit().await.context("committing purge")?;
        Ok(counts)
    }
}

async fn insert_message(conn: &mut SqliteConnection, message: &NewMessage) -> Result<Message> {
    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    sqlx::query(
        r#"
        INSERT INTO messages (id, chat_id, seq, role, content, is_ocr, created_at)
        VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?), ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&message.chat_id)
    .bind(&message.chat_id)
    .bind(message.role.to_string())
    .bind(&message.content)
    .bind(message.is_ocr)
    .bind(&now)
    .execute(&mut *conn)
    .await
    .context("inserting message")?;

    sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(&message.chat_id)
        .execute(&mut *conn)
        .await
        .context("touching chat")?;

    sqlx::query_as::<_, Message>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
        .bind(&id)
        .fetch_one(&mut *conn)
        .await
        .context("fetching message")
}

async fn insert_upload(
    conn: &mut SqliteConnection,
    message_id: &str,
    upload: &NewUpload,
) -> Result<Upload> {
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO uploads (id, message_id, original_file_name, stored_file_name, destination, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(message_id)
    .bind(&upload.original_file_name)
    .bind(&upload.stored_file_name)
    .bind(&upload.destination)
    .bind(now_timestamp())
    .execute(&mut *conn)
    .await
    .context("inserting upload")?;

    sqlx::query_as::<_, Upload>(&format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?"))
        .bind(&id)
        .fetch_one(&mut *conn)
        .await
        .context("fetching upload")
}
