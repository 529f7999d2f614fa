//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, header};
use futures::StreamExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Notify;

use assist::api::{AppState, create_router};
use assist::assistant::{Assistant, AssistantRegistry};
use assist::chat::{ChatService, ChatSettings, RetryConfig};
use assist::db::Database;
use assist::export::{
    ArchiveUploader, ExportPipeline, ExportSettings, LocalDirUploader, UploadReceipt,
};
use assist::ingest::{AttachmentIngestor, DocumentConverter, TextExtractor};
use assist::llm::{CompletionClient, CompletionRequest, EventStream, LlmError, StreamEvent};
use assist::report::{PdfReportRenderer, ReportRenderer};
use assist::store::{Chat, ConversationRepository, MessageRole, NewChat, NewMessage, User};

pub type Script = Vec<Result<StreamEvent, LlmError>>;

/// Completion client that replays queued scripts, one per call.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Result<Script, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn push(&self, script: Result<Script, LlmError>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Queue a reply streamed as the given deltas, then completion.
    pub fn push_reply(&self, deltas: &[&str]) {
        let mut script: Script = deltas
            .iter()
            .map(|d| Ok(StreamEvent::TextDelta(d.to_string())))
            .collect();
        script.push(Ok(StreamEvent::Completed));
        self.push(Ok(script));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn stream_completion(
        &self,
        _api_key: &str,
        request: CompletionRequest,
    ) -> Result<EventStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![Ok(StreamEvent::Completed)]))?;
        Ok(futures::stream::iter(script).boxed())
    }
}

/// Extractor returning the same text for every file.
pub struct FixedExtractor(pub Option<String>);

#[async_trait]
impl TextExtractor for FixedExtractor {
    async fn extract_text(&self, _path: &Path) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Converter that leaves files where they are.
pub struct NoConvert;

#[async_trait]
impl DocumentConverter for NoConvert {
    async fn convert_to_pdf(&self, source: &Path) -> Result<PathBuf> {
        Ok(source.to_path_buf())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadBehaviour {
    /// Store the archive and acknowledge it faithfully.
    Verified,
    /// Store the archive but acknowledge the wrong checksum.
    Corrupt,
    /// Fail the upload.
    Fail,
}

/// Uploader with scripted acknowledgements and an optional gate that holds
/// uploads until released.
pub struct TestUploader {
    behaviour: UploadBehaviour,
    inner: LocalDirUploader,
    gated: bool,
    pub started: Notify,
    pub release: Notify,
    uploaded: Mutex<Vec<String>>,
}

impl TestUploader {
    pub fn new(behaviour: UploadBehaviour, dir: &Path) -> Self {
        Self {
            behaviour,
            inner: LocalDirUploader::new(dir),
            gated: false,
            started: Notify::new(),
            release: Notify::new(),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveUploader for TestUploader {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<UploadReceipt> {
        if self.gated {
            self.started.notify_one();
            self.release.notified().await;
        }
        if self.behaviour == UploadBehaviour::Fail {
            bail!("archive server unreachable");
        }

        let mut receipt = self.inner.upload(local_path, remote_name).await?;
        self.uploaded.lock().unwrap().push(remote_name.to_string());
        if self.behaviour == UploadBehaviour::Corrupt {
            receipt.sha256 = "0".repeat(64);
        }
        Ok(receipt)
    }
}

pub fn assistant(id: &str, code: &str, enabled: bool) -> Assistant {
    Assistant {
        id: id.to_string(),
        code: code.to_string(),
        display_name: format!("Assistant {code}"),
        enabled,
        system_prompt: format!("You are {code}."),
        vector_store_ids: Vec::new(),
        api_key: "sk-test".to_string(),
        first_reply_is_document: false,
    }
}

/// A fully wired application over an in-memory store and a temp directory.
pub struct TestApp {
    pub state: AppState,
    pub repo: ConversationRepository,
    pub client: Arc<ScriptedClient>,
    pub uploader: Arc<TestUploader>,
    pub export: ExportPipeline,
    pub temp: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_upload(UploadBehaviour::Verified, false).await
    }

    /// Assistants `a1` (code `A1`) and `a2` (code `A2`, disabled) are registered.
    pub async fn with_upload(behaviour: UploadBehaviour, gated: bool) -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let db = Database::in_memory().await.expect("open database");
        let repo = ConversationRepository::new(db.pool().clone());

        let registry = AssistantRegistry::new([
            assistant("a1", "A1", true),
            assistant("a2", "A2", false),
        ]);
        registry.sync_to_store(&repo).await.expect("sync assistants");

        let client = Arc::new(ScriptedClient::default());
        let ingestor = AttachmentIngestor::new(
            Arc::new(NoConvert),
            Arc::new(FixedExtractor(Some("EXTRACTED TEXT".to_string()))),
        );
        let settings = ChatSettings {
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
                total_timeout_secs: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        let chat = ChatService::new(repo.clone(), registry, client.clone(), ingestor, settings);

        let mut uploader = TestUploader::new(behaviour, &temp.path().join("archive"));
        if gated {
            uploader = uploader.gated();
        }
        let uploader = Arc::new(uploader);

        let renderer: Arc<dyn ReportRenderer> = Arc::new(PdfReportRenderer::new("Assist Test"));
        let export = ExportPipeline::new(
            repo.clone(),
            renderer.clone(),
            uploader.clone(),
            ExportSettings {
                root: temp.path().join("export"),
                require_verified_upload: true,
            },
        );

        let state = AppState::new(chat, export.clone(), renderer, temp.path().join("uploads"));

        Self {
            state,
            repo,
            client,
            uploader,
            export,
            temp,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.temp.path().join("archive")
    }

    pub fn export_root(&self) -> PathBuf {
        self.temp.path().join("export")
    }
}

pub async fn add_user(repo: &ConversationRepository, id: &str, username: &str, role: &str) {
    repo.upsert_user(&User {
        id: id.to_string(),
        username: username.to_string(),
        role: role.to_string(),
    })
    .await
    .expect("upsert user");
}

/// Create a chat with `messages` alternating user/assistant turns.
pub async fn seed_chat(
    repo: &ConversationRepository,
    user_id: &str,
    assistant_id: &str,
    session_id: &str,
    messages: usize,
) -> Chat {
    let chat = repo
        .get_or_create_chat(NewChat {
            user_id: user_id.to_string(),
            assistant_id: assistant_id.to_string(),
            session_id: session_id.to_string(),
            title: Some(format!("Chat {session_id}")),
        })
        .await
        .expect("create chat");
    repo.touch_session(session_id, user_id)
        .await
        .expect("touch session");

    for i in 0..messages {
        let role = if i % 2 == 0 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        repo.append_message(NewMessage {
            chat_id: chat.id.clone(),
            role,
            content: format!("message {i} in {session_id}"),
            is_ocr: false,
        })
        .await
        .expect("append message");
    }
    chat
}

pub fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Decode every `data:` line of an event-stream body.
pub async fn sse_frames(response: Response<Body>) -> Vec<Value> {
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}
