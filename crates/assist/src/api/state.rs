//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::chat::ChatService;
use crate::export::ExportPipeline;
use crate::report::ReportRenderer;
use crate::store::ConversationRepository;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub export: ExportPipeline,
    pub renderer: Arc<dyn ReportRenderer>,
    /// Where multipart uploads are stored before ingestion.
    pub upload_dir: PathBuf,
    /// Origins allowed by CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        chat: ChatService,
        export: ExportPipeline,
        renderer: Arc<dyn ReportRenderer>,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            chat,
            export,
            renderer,
            upload_dir,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn repo(&self) -> &ConversationRepository {
        self.chat.repository()
    }
}
