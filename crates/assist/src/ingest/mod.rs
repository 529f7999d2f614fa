//! Attachment ingestion.
//!
//! Word-processor documents are converted to PDF first, then every
//! attachment goes through text extraction. A failing attachment is logged
//! and skipped: it gets no upload record and contributes no text.

mod convert;
mod extract;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

pub use convert::{DocumentConverter, SofficeConverter, pdf_path_for};
pub use extract::{OcrSpaceExtractor, PdfTextExtractor, TextExtractor};

use crate::store::NewUpload;

/// MIME type of `.docx` documents.
pub const WORD_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Separator placed between the typed message and extracted text.
pub const TEXT_SEPARATOR: &str = "\r\n\r\n";

/// A file received with a chat message, already saved to disk.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub original_name: String,
    pub stored_path: PathBuf,
    pub content_type: Option<String>,
}

impl Attachment {
    /// Whether the file must be converted to PDF before extraction.
    pub fn is_word_document(&self) -> bool {
        let mime = self
            .content_type
            .clone()
            .unwrap_or_else(|| mime_guess::from_path(&self.original_name).first_or_octet_stream().to_string());
        mime == WORD_MIME
    }

    fn upload_record(&self) -> NewUpload {
        let stored_file_name = self
            .stored_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let destination = self
            .stored_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        NewUpload {
            original_file_name: self.original_name.clone(),
            stored_file_name,
            destination,
        }
    }
}

/// Result of ingesting a batch of attachments.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// One record per attachment whose ingestion completed.
    pub uploads: Vec<NewUpload>,
    /// Non-empty extracted texts, in attachment order.
    pub texts: Vec<String>,
}

impl IngestOutcome {
    pub fn has_text(&self) -> bool {
        !self.texts.is_empty()
    }

    /// Join the typed message with every extracted text.
    pub fn combine_with(&self, message: &str) -> String {
        let mut content = message.trim().to_string();
        for text in &self.texts {
            if !content.is_empty() {
                content.push_str(TEXT_SEPARATOR);
            }
            content.push_str(text);
        }
        content
    }
}

/// Runs conversion and extraction for chat attachments.
#[derive(Clone)]
pub struct AttachmentIngestor {
    converter: Arc<dyn DocumentConverter>,
    extractor: Arc<dyn TextExtractor>,
}

impl AttachmentIngestor {
    pub fn new(converter: Arc<dyn DocumentConverter>, extractor: Arc<dyn TextExtractor>) -> Self {
        Self {
            converter,
            extractor,
        }
    }

    /// Ingest one attachment, returning its extracted text (if any).
    pub async fn ingest_one(&self, attachment: &Attachment) -> Result<Option<String>> {
        let source = if attachment.is_word_document() {
            self.converter.convert_to_pdf(&attachment.stored_path).await?
        } else {
            attachment.stored_path.clone()
        };
        self.extractor.extract_text(&source).await
    }

    /// Ingest every attachment sequentially, skipping failures.
    pub async fn ingest(&self, attachments: &[Attachment]) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        for attachment in attachments {
            match self.ingest_one(attachment).await {
                Ok(text) => {
                    outcome.uploads.push(attachment.upload_record());
                    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                        outcome.texts.push(text);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        file = %attachment.original_name,
                        error = %e,
                        "Attachment ingestion failed, skipping"
                    );
                }
            }
        }

        outcome
    }
}

impl std::fmt::Debug for AttachmentIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentIngestor").finish_non_exhaustive()
    }
}

/// Strip path components and unsafe characters from an uploaded file name.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let base = Path::new(filename.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Windows-style paths survive Path::file_name on unix.
    let base = base.rsplit('\\').next().unwrap_or_default();

    let sanitized: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c| c == '.' || c == ' ');

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized.to_string())
    }
}
