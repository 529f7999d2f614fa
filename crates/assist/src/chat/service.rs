//! Chat turn orchestration.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::frames::ChatFrame;
use super::retry::{RetryConfig, open_with_retry};
use super::ChatError;
use crate::assistant::{Assistant, AssistantRegistry};
use crate::ingest::{Attachment, AttachmentIngestor, IngestOutcome};
use crate::llm::{
    CompletionClient, CompletionRequest, InputMessage, InputRole, LlmError, StreamEvent, Tool,
};
use crate::store::{ConversationRepository, Message, MessageRole, NewChat, NewMessage};

/// Default context instruction sent ahead of the history.
pub const DEFAULT_CONTEXT_INSTRUCTION: &str = "Answer strictly from your system knowledge.";

/// Orchestrator settings derived from configuration.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub context_instruction: String,
    /// Re-send OCR-derived messages as model context.
    pub include_ocr_in_context: bool,
    pub retry: RetryConfig,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4.1-mini".to_string(),
            context_instruction: DEFAULT_CONTEXT_INSTRUCTION.to_string(),
            include_ocr_in_context: false,
            retry: RetryConfig::default(),
        }
    }
}

/// An incoming chat message.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub user_id: String,
    pub assistant_id: String,
    pub session_id: String,
    pub message: String,
    /// Title for a chat created by this request.
    pub title: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// A validated request with attachments ingested. Nothing is stored yet.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub user_id: String,
    pub session_id: String,
    pub title: Option<String>,
    pub assistant: Assistant,
    /// Message text with extracted attachment text appended.
    pub content: String,
    pub ingest: IngestOutcome,
}

/// What a completed (or client-abandoned) turn left in the store.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub chat_id: String,
    pub user_message_id: String,
    pub assistant_message_id: Option<String>,
    /// Text delivered to the client, as persisted.
    pub reply: String,
    pub client_disconnected: bool,
}

/// The streaming conversation orchestrator.
#[derive(Clone)]
pub struct ChatService {
    repo: ConversationRepository,
    registry: AssistantRegistry,
    client: Arc<dyn CompletionClient>,
    ingestor: AttachmentIngestor,
    settings: Arc<ChatSettings>,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("assistants", &self.registry.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ChatService {
    pub fn new(
        repo: ConversationRepository,
        registry: AssistantRegistry,
        client: Arc<dyn CompletionClient>,
        ingestor: AttachmentIngestor,
        settings: ChatSettings,
    ) -> Self {
        Self {
            repo,
            registry,
            client,
            ingestor,
            settings: Arc::new(settings),
        }
    }

    pub fn repository(&self) -> &ConversationRepository {
        &self.repo
    }

    pub fn registry(&self) -> &AssistantRegistry {
        &self.registry
    }

    /// Validate a request and ingest its attachments.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, assistant = %request.assistant_id))]
    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedTurn, ChatError> {
        for (name, value) in [
            ("userId", &request.user_id),
            ("assistantId", &request.assistant_id),
            ("sessionId", &request.session_id),
        ] {
            if value.trim().is_empty() {
                return Err(ChatError::Validation(format!("invalid field: {name}")));
            }
        }

        let assistant = self
            .registry
            .get(&request.assistant_id)
            .cloned()
            .ok_or_else(|| ChatError::UnknownAssistant(request.assistant_id.clone()))?;

        let ingest = self.ingestor.ingest(&request.attachments).await;
        let content = ingest.combine_with(&request.message);
        if content.is_empty() {
            return Err(ChatError::Validation(
                "message or file required".to_string(),
            ));
        }

        debug!(
            attachments = request.attachments.len(),
            ingested = ingest.uploads.len(),
            extracted = ingest.texts.len(),
            "Prepared chat turn"
        );

        Ok(PreparedTurn {
            user_id: request.user_id,
            session_id: request.session_id,
            title: request.title,
            assistant,
            content,
            ingest,
        })
    }

    /// Run a prepared turn, pushing frames into `tx`.
    ///
    /// Any failure is also sent to the client as a final error frame.
    #[instrument(skip(self, turn, tx), fields(session_id = %turn.session_id, assistant = %turn.assistant.id))]
    pub async fn run_turn(
        &self,
        turn: PreparedTurn,
        tx: mpsc::Sender<ChatFrame>,
    ) -> Result<TurnOutcome, ChatError> {
        match self.relay_turn(turn, &tx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "Chat turn failed");
                let _ = tx.send(ChatFrame::error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn relay_turn(
        &self,
        turn: PreparedTurn,
        tx: &mpsc::Sender<ChatFrame>,
    ) -> Result<TurnOutcome, ChatError> {
        let chat = self
            .repo
            .get_or_create_chat(NewChat {
                user_id: turn.user_id.clone(),
                assistant_id: turn.assistant.id.clone(),
                session_id: turn.session_id.clone(),
                title: turn.title.clone(),
            })
            .await?;
        self.repo.ensure_user(&turn.user_id).await?;
        self.repo
            .touch_session(&turn.session_id, &turn.user_id)
            .await?;

        let is_first_message = self.repo.count_messages(&chat.id).await? == 0;
        let is_ocr =
            turn.ingest.has_text() || (is_first_message && turn.assistant.first_reply_is_document);

        let history = self
            .repo
            .list_messages(&chat.id, self.settings.include_ocr_in_context)
            .await?;
        let request = build_request(&self.settings, &turn.assistant, &history, &turn.content);

        let mut events = open_with_retry(
            self.client.as_ref(),
            &turn.assistant.api_key,
            &request,
            &self.settings.retry,
        )
        .await?;

        let (user_message, uploads) = self
            .repo
            .record_user_turn(
                NewMessage {
                    chat_id: chat.id.clone(),
                    role: MessageRole::User,
                    content: turn.content.clone(),
                    is_ocr,
                },
                turn.ingest.uploads.clone(),
            )
            .await?;
        debug!(
            chat_id = %chat.id,
            message_id = %user_message.id,
            uploads = uploads.len(),
            is_ocr,
            "Recorded user turn"
        );

        let mut reply = String::new();
        let mut client_disconnected = false;
        let mut stream_failure: Option<LlmError> = None;

        while let Some(event) = events.next().await {
            match event {
                Ok(StreamEvent::TextDelta(delta)) => {
                    if tx.send(ChatFrame::delta(delta.as_str())).await.is_err() {
                        client_disconnected = true;
                        break;
                    }
                    reply.push_str(&delta);
                }
                Ok(StreamEvent::Completed) => {
                    if tx.send(ChatFrame::done()).await.is_err() {
                        client_disconnected = true;
                        break;
                    }
                }
                Ok(StreamEvent::Error(message)) => {
                    warn!(chat_id = %chat.id, error = %message, "Upstream reported an error");
                    if tx.send(ChatFrame::error(message)).await.is_err() {
                        client_disconnected = true;
                        break;
                    }
                }
                Ok(StreamEvent::Other) => {}
                Err(e) => {
                    stream_failure = Some(e);
                    break;
                }
            }
        }
        drop(events);

        if client_disconnected {
            info!(chat_id = %chat.id, "Client disconnected, stopping relay");
        }

        // Whatever reached the client is kept, even when the stream broke off.
        let assistant_message_id = if stream_failure.is_none() || !reply.is_empty() {
            let stored = self
                .repo
                .append_message(NewMessage {
                    chat_id: chat.id.clone(),
                    role: MessageRole::Assistant,
                    content: reply.clone(),
                    is_ocr: false,
                })
                .await?;
            Some(stored.id)
        } else {
            None
        };

        if let Some(e) = stream_failure {
            return Err(ChatError::Upstream(e));
        }

        info!(
            chat_id = %chat.id,
            reply_len = reply.len(),
            "Chat turn complete"
        );

        Ok(TurnOutcome {
            chat_id: chat.id,
            user_message_id: user_message.id,
            assistant_message_id,
            reply,
            client_disconnected,
        })
    }
}

/// Build the upstream payload: instruction, history, new user turn.
pub fn build_request(
    settings: &ChatSettings,
    assistant: &Assistant,
    history: &[Message],
    content: &str,
) -> CompletionRequest {
    let mut input = Vec::with_capacity(history.len() + 2);
    input.push(InputMessage::new(
        InputRole::System,
        settings.context_instruction.as_str(),
    ));
    input.extend(history.iter().map(|message| {
        let role = match message.role {
            MessageRole::User => InputRole::User,
            MessageRole::Assistant => InputRole::Assistant,
        };
        InputMessage::new(role, message.content.as_str())
    }));
    input.push(InputMessage::new(InputRole::User, content));

    let tools = if assistant.vector_store_ids.is_empty() {
        Vec::new()
    } else {
        vec![Tool::FileSearch {
            vector_store_ids: assistant.vector_store_ids.clone(),
        }]
    };

    CompletionRequest {
        model: settings.model.clone(),
        instructions: (!assistant.system_prompt.is_empty())
            .then(|| assistant.system_prompt.clone()),
        input,
        stream: true,
        tools,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ingest::{DocumentConverter, TextExtractor};
    use crate::llm::EventStream;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    type Script = Vec<Result<StreamEvent, LlmError>>;

    struct FakeClient {
        scripts: Mutex<VecDeque<Result<Script, LlmError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl FakeClient {
        fn new(scripts: Vec<Result<Script, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for FakeClient {
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

    struct FixedExtractor(Option<String>);

    #[async_trait]
    impl TextExtractor for FixedExtractor {
        async fn extract_text(&self, _path: &Path) -> Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    struct NoConvert;

    #[async_trait]
    impl DocumentConverter for NoConvert {
        async fn convert_to_pdf(&self, source: &Path) -> Result<PathBuf> {
            Ok(source.to_path_buf())
        }
    }

    fn assistant(first_reply_is_document: bool, vector_store_ids: Vec<String>) -> Assistant {
        Assistant {
            id: "a1".to_string(),
            code: "A1".to_string(),
            display_name: "Helper".to_string(),
            enabled: true,
            system_prompt: "You are helpful.".to_string(),
            vector_store_ids,
            api_key: "sk-test".to_string(),
            first_reply_is_document,
        }
    }

    async fn service(
        client: Arc<FakeClient>,
        extracted: Option<&str>,
        first_reply_is_document: bool,
    ) -> ChatService {
        let db = Database::in_memory().await.unwrap();
        let repo = ConversationRepository::new(db.pool().clone());
        let registry = AssistantRegistry::new([assistant(first_reply_is_document, vec![])]);
        let ingestor = AttachmentIngestor::new(
            Arc::new(NoConvert),
            Arc::new(FixedExtractor(extracted.map(str::to_string))),
        );
        ChatService::new(repo, registry, client, ingestor, ChatSettings::default())
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            user_id: "u1".to_string(),
            assistant_id: "a1".to_string(),
            session_id: "sess-1".to_string(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    fn deltas(parts: &[&str]) -> Script {
        let mut script: Script = parts
            .iter()
            .map(|p| Ok(StreamEvent::TextDelta(p.to_string())))
            .collect();
        script.push(Ok(StreamEvent::Completed));
        script
    }

    async fn run(service: &ChatService, request: ChatRequest) -> (Result<TurnOutcome, ChatError>, Vec<ChatFrame>) {
        let turn = service.prepare(request).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let result = service.run_turn(turn, tx).await;
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        (result, frames)
    }

    #[tokio::test]
    async fn test_relay_persists_exact_reply() {
        let client = FakeClient::new(vec![Ok(deltas(&["Hel", "lo", " there"]))]);
        let service = service(client, None, false).await;

        let (result, frames) = run(&service, request("hi")).await;
        let outcome = result.unwrap();

        assert_eq!(
            frames,
            vec![
                ChatFrame::delta("Hel"),
                ChatFrame::delta("lo"),
                ChatFrame::delta(" there"),
                ChatFrame::done(),
            ]
        );
        let messages = service
            .repository()
            .list_messages(&outcome.chat_id, true)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "Hello there");
        assert_eq!(outcome.reply, "Hello there");
    }

    #[tokio::test]
    async fn test_inline_error_does_not_abort_bookkeeping() {
        let client = FakeClient::new(vec![Ok(vec![
            Ok(StreamEvent::TextDelta("partial".to_string())),
            Ok(StreamEvent::Error("content filter".to_string())),
            Ok(StreamEvent::Completed),
        ])]);
        let service = service(client, None, false).await;

        let (result, frames) = run(&service, request("hi")).await;
        let outcome = result.unwrap();
        assert_eq!(frames[1], ChatFrame::error("content filter"));
        assert!(outcome.assistant_message_id.is_some());
    }

    #[tokio::test]
    async fn test_terminal_error_keeps_nothing_before_stream() {
        let client = FakeClient::new(vec![Err(LlmError::Api {
            status: Some(500),
            code: None,
            message: "down".to_string(),
        })]);
        let service = service(client, None, false).await;

        let (result, frames) = run(&service, request("hi")).await;
        assert!(matches!(result, Err(ChatError::Upstream(_))));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_error());

        let counts = service.repository().record_counts().await.unwrap();
        assert_eq!(counts.messages, 0);
        assert_eq!(counts.chats, 1);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_user_message() {
        let client = FakeClient::new(vec![Ok(vec![Err(LlmError::Transport(
            "connection reset".to_string(),
        ))])]);
        let service = service(client, None, false).await;

        let (result, frames) = run(&service, request("hi")).await;
        assert!(result.is_err());
        assert!(frames.last().unwrap().is_error());

        let unanswered = service.repository().find_unanswered_messages().await.unwrap();
        assert_eq!(unanswered.len(), 1);
        assert_eq!(unanswered[0].content, "hi");
    }

    #[tokio::test]
    async fn test_history_excludes_ocr_and_adds_tools() {
        let client = FakeClient::new(vec![Ok(deltas(&["first"])), Ok(deltas(&["second"]))]);
        let service = service(client.clone(), Some("Scanned text"), false).await;

        let mut first = request("see file");
        first.attachments = vec![Attachment {
            original_name: "scan.pdf".to_string(),
            stored_path: PathBuf::from("/tmp/scan.pdf"),
            content_type: Some("application/pdf".to_string()),
        }];
        let (result, _) = run(&service, first).await;
        let outcome = result.unwrap();

        let messages = service
            .repository()
            .list_messages(&outcome.chat_id, true)
            .await
            .unwrap();
        assert!(messages[0].is_ocr);
        assert_eq!(messages[0].content, "see file\r\n\r\nScanned text");
        assert_eq!(
            service
                .repository()
                .list_uploads(&messages[0].id)
                .await
                .unwrap()
                .len(),
            1
        );

        let (result, _) = run(&service, request("and now?")).await;
        result.unwrap();

        let requests = client.requests.lock().unwrap();
        let second = &requests[1];
        assert_eq!(second.input[0].role, InputRole::System);
        assert_eq!(second.input[0].content, DEFAULT_CONTEXT_INSTRUCTION);
        // OCR user turn is hidden, the assistant reply to it is not.
        let contents: Vec<_> = second.input.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[1..], ["first", "and now?"]);
        assert_eq!(second.instructions.as_deref(), Some("You are helpful."));
    }

    #[tokio::test]
    async fn test_first_reply_document_marks_ocr_once() {
        let client = FakeClient::new(vec![Ok(deltas(&["a"])), Ok(deltas(&["b"]))]);
        let service = service(client, None, true).await;

        let (first, _) = run(&service, request("case notes")).await;
        let chat_id = first.unwrap().chat_id;
        run(&service, request("follow up")).await.0.unwrap();

        let messages = service
            .repository()
            .list_messages(&chat_id, true)
            .await
            .unwrap();
        let flags: Vec<_> = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.is_ocr)
            .collect();
        assert_eq!(flags, vec![true, false]);
    }

    #[tokio::test]
    async fn test_validation_creates_nothing() {
        let client = FakeClient::new(vec![]);
        let service = service(client.clone(), None, false).await;

        let result = service.prepare(request("   ")).await;
        assert!(matches!(result, Err(ChatError::Validation(_))));

        let mut missing = request("hi");
        missing.session_id = String::new();
        assert!(matches!(
            service.prepare(missing).await,
            Err(ChatError::Validation(_))
        ));

        let mut unknown = request("hi");
        unknown.assistant_id = "nope".to_string();
        assert!(matches!(
            service.prepare(unknown).await,
            Err(ChatError::UnknownAssistant(_))
        ));

        assert!(service.repository().record_counts().await.unwrap().is_empty());
        assert!(client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_persists_delivered_text() {
        let client = FakeClient::new(vec![Ok(deltas(&["one", "two", "three"]))]);
        let service = service(client, None, false).await;

        let turn = service.prepare(request("hi")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let reader = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });

        let outcome = service.run_turn(turn, tx).await.unwrap();
        assert_eq!(reader.await.unwrap(), Some(ChatFrame::delta("one")));
        assert!(outcome.client_disconnected);

        let messages = service
            .repository()
            .list_messages(&outcome.chat_id, true)
            .await
            .unwrap();
        assert_eq!(messages.last().unwrap().content, outcome.reply);
        assert!(outcome.reply.starts_with("one"));
    }

    #[test]
    fn test_build_request_with_vector_stores() {
        let a = assistant(false, vec!["vs_1".to_string(), "vs_2".to_string()]);
        let request = build_request(&ChatSettings::default(), &a, &[], "question");

        assert_eq!(
            request.tools,
            vec![Tool::FileSearch {
                vector_store_ids: vec!["vs_1".to_string(), "vs_2".to_string()],
            }]
        );
        assert_eq!(request.input.len(), 2);
        assert_eq!(request.input[1].content, "question");
        assert!(request.stream);
    }
}
