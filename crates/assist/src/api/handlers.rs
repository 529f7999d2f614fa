//! HTTP handlers.

use std::convert::Infallible;
use std::path::Path as FsPath;

use anyhow::Context;
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::header,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::chat::{ChatFrame, ChatRequest, ChatService, PreparedTurn};
use crate::ingest::{Attachment, sanitize_filename};
use crate::report::report_file_name;
use crate::store::{Chat, Message, RecordCounts, User};

/// Frames buffered between the relay task and the HTTP body.
const FRAME_BUFFER: usize = 1;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Chat streaming
// ============================================================================

/// Body of a chat message (the `payload` field in the multipart variant).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamChatRequest {
    pub user_id: String,
    pub assistant_id: String,
    pub session_id: String,
    pub message: String,
    pub title: Option<String>,
}

impl StreamChatRequest {
    fn into_chat_request(self, attachments: Vec<Attachment>) -> ChatRequest {
        ChatRequest {
            user_id: self.user_id,
            assistant_id: self.assistant_id,
            session_id: self.session_id,
            message: self.message,
            title: self.title.filter(|t| !t.trim().is_empty()),
            attachments,
        }
    }
}

/// Stream an assistant reply for a JSON chat message.
#[instrument(skip(state, req), fields(session_id = %req.session_id))]
pub async fn stream_chat(
    State(state): State<AppState>,
    Json(req): Json<StreamChatRequest>,
) -> ApiResult<Response> {
    let turn = state.chat.prepare(req.into_chat_request(Vec::new())).await?;
    Ok(relay(state.chat.clone(), turn))
}

/// Stream an assistant reply for a multipart message with attachments.
///
/// The `payload` field carries the JSON body; every field with a file name
/// is stored under the upload directory and ingested.
#[instrument(skip(state, multipart))]
pub async fn stream_chat_multipart(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut payload: Option<StreamChatRequest> = None;
    let mut attachments = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field
            .content_type()
            .filter(|ct| *ct != "application/octet-stream")
            .map(str::to_string);

        if name == "payload" && file_name.is_none() {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?;
            let parsed = serde_json::from_str(&text)
                .map_err(|_| ApiError::bad_request("Invalid JSON in 'payload'"))?;
            payload = Some(parsed);
            continue;
        }

        let Some(raw_name) = file_name else {
            warn!(field = %name, "Ignoring unexpected multipart field");
            continue;
        };
        let original_name = sanitize_filename(&raw_name).ok_or_else(|| {
            warn!("Rejected invalid filename: {:?}", raw_name);
            ApiError::bad_request(format!("Invalid filename: {raw_name}"))
        })?;

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?;
        let stored_path = state.upload_dir.join(stored_file_name(&original_name));
        tokio::fs::create_dir_all(&state.upload_dir)
            .await
            .context("creating upload directory")?;
        tokio::fs::write(&stored_path, &data)
            .await
            .with_context(|| format!("saving upload {}", stored_path.display()))?;

        info!(
            original = %original_name,
            stored = %stored_path.display(),
            size = data.len(),
            "Stored chat attachment"
        );
        attachments.push(Attachment {
            original_name,
            stored_path,
            content_type,
        });
    }

    let payload = payload.ok_or_else(|| ApiError::bad_request("invalid field: payload"))?;
    let turn = state
        .chat
        .prepare(payload.into_chat_request(attachments))
        .await?;
    Ok(relay(state.chat.clone(), turn))
}

/// Run the turn in the background and expose its frames as SSE.
///
/// Dropping the response body closes the frame channel, which the relay
/// treats as a client disconnect.
fn relay(chat: ChatService, turn: PreparedTurn) -> Response {
    let (tx, rx) = mpsc::channel::<ChatFrame>(FRAME_BUFFER);

    tokio::spawn(async move {
        // Failures are already logged and pushed as an error frame.
        let _ = chat.run_turn(turn, tx).await;
    });

    let stream = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.to_json())));

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// `{uuid}.{ext}`, keeping the original extension for type detection.
fn stored_file_name(original_name: &str) -> String {
    let id = Uuid::new_v4().simple();
    match FsPath::new(original_name).extension() {
        Some(ext) => format!("{id}.{}", ext.to_string_lossy().to_lowercase()),
        None => id.to_string(),
    }
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChatsQuery {
    pub user_id: Option<String>,
    pub assistant_id: Option<String>,
}

/// List chats for a user. Admins see every user's chats.
#[instrument(skip(state))]
pub async fn list_chats(
    State(state): State<AppState>,
    Query(query): Query<ListChatsQuery>,
) -> ApiResult<Json<Vec<Chat>>> {
    let user_id = query
        .user_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Please provide valid userId"))?;
    let user = state
        .repo()
        .get_user(&user_id)
        .await?
        .ok_or_else(|| ApiError::bad_request("Please provide valid userId"))?;

    let owner = if user.is_admin() {
        None
    } else {
        Some(user.id.as_str())
    };
    let assistant = query.assistant_id.as_deref().filter(|id| !id.is_empty());

    let chats = state.repo().list_chats(owner, assistant).await?;
    Ok(Json(chats))
}

/// Messages of one chat, without OCR-derived turns.
#[instrument(skip(state))]
pub async fn list_chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let chat = state
        .repo()
        .get_chat(&chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("chat {chat_id}")))?;
    let messages = state.repo().list_messages(&chat.id, false).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTitleRequest {
    pub session_id: String,
    pub title: String,
}

/// Rename the chat bound to a session.
#[instrument(skip(state, req), fields(session_id = %req.session_id))]
pub async fn update_chat_title(
    State(state): State<AppState>,
    Json(req): Json<UpdateTitleRequest>,
) -> ApiResult<Json<Chat>> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("title must be non-empty"));
    }
    let chat = state
        .repo()
        .update_chat_title(&req.session_id, title)
        .await?
        .ok_or_else(|| ApiError::bad_request("Chat session does not exist"))?;
    info!(chat_id = %chat.id, "Updated chat title");
    Ok(Json(chat))
}

/// Download a single chat transcript as a PDF.
#[instrument(skip(state))]
pub async fn chat_report(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let chat = state
        .repo()
        .find_chat_by_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::bad_request("No chat history found"))?;
    let messages = state.repo().list_messages(&chat.id, false).await?;
    if messages.len() < 2 {
        return Err(ApiError::bad_request("No chat history found"));
    }

    let assistant_name = match state.chat.registry().get(&chat.assistant_id) {
        Some(assistant) => assistant.display_name.clone(),
        None => state
            .repo()
            .get_assistant(&chat.assistant_id)
            .await?
            .map(|record| record.display_name)
            .unwrap_or_else(|| "Assistant".to_string()),
    };

    let renderer = state.renderer.clone();
    let file_name = download_file_name(&chat, renderer.extension());
    let render_chat = chat.clone();
    let bytes = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        renderer.render(&mut buf, &render_chat, &assistant_name, &messages)?;
        Ok(buf)
    })
    .await
    .context("report task panicked")?
    .context("rendering chat report")?;

    info!(chat_id = %chat.id, bytes = bytes.len(), "Rendered chat report");
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        bytes,
    )
        .into_response())
}

/// Header-safe download name: the chat title when usable, else the dated name.
fn download_file_name(chat: &Chat, extension: &str) -> String {
    let stem: String = chat
        .title
        .as_deref()
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if stem.is_empty() {
        report_file_name(chat.created(), 1, extension)
    } else {
        format!("{stem}.{extension}")
    }
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SyncUserRequest {
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Register or update a user from the identity provider.
#[instrument(skip(state, req))]
pub async fn sync_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<SyncUserRequest>,
) -> ApiResult<Json<User>> {
    let username = req.username.trim();
    if user_id.trim().is_empty() || username.is_empty() {
        return Err(ApiError::bad_request("username must be non-empty"));
    }
    let user = User {
        id: user_id,
        username: username.to_string(),
        role: req
            .role
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "user".to_string()),
    };
    state.repo().upsert_user(&user).await?;
    Ok(Json(user))
}

// ============================================================================
// Export
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub message: &'static str,
    pub path: String,
    pub message_count: u64,
    pub report_count: u64,
    pub uploaded: bool,
    pub purged: Option<RecordCounts>,
}

/// Run the bulk export once. A concurrent run is rejected with 409.
#[instrument(skip(state))]
pub async fn run_export(State(state): State<AppState>) -> ApiResult<Json<ExportResponse>> {
    let report = state.export.run().await?;
    Ok(Json(ExportResponse {
        message: "Export completed",
        path: report.archive_path.display().to_string(),
        message_count: report.message_count,
        report_count: report.report_count,
        uploaded: report.uploaded,
        purged: report.purged,
    }))
}
