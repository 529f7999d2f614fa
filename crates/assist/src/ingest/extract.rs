//! Text extraction from PDFs and images.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

/// Extracts readable text from a file.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Returns `None` when the file carries no recognisable text.
    async fn extract_text(&self, path: &Path) -> Result<Option<String>>;
}

/// Extractor backed by the OCR.space HTTP API.
#[derive(Debug, Clone)]
pub struct OcrSpaceExtractor {
    client: Client,
    url: String,
    api_key: String,
    language: String,
    engine: u8,
}

impl OcrSpaceExtractor {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        language: impl Into<String>,
        engine: u8,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building OCR HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            language: language.into(),
            engine,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OcrResponse {
    #[serde(default)]
    parsed_results: Vec<ParsedResult>,
    #[serde(default)]
    is_errored_on_processing: bool,
    #[serde(default)]
    error_message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParsedResult {
    #[serde(default)]
    parsed_text: String,
}

impl OcrResponse {
    fn into_text(self) -> Result<Option<String>> {
        if self.is_errored_on_processing {
            let detail = self
                .error_message
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("OCR processing failed: {detail}");
        }

        let text = self
            .parsed_results
            .into_iter()
            .map(|r| r.parsed_text)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(non_blank(text))
    }
}

#[async_trait]
impl TextExtractor for OcrSpaceExtractor {
    async fn extract_text(&self, path: &Path) -> Result<Option<String>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.pdf")
            .to_string();
        let mime = mime_guess::from_path(path).first_or_octet_stream();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime.as_ref())
            .context("building OCR upload part")?;
        let form = Form::new()
            .text("apikey", self.api_key.clone())
            .text("language", self.language.clone())
            .text("OCREngine", self.engine.to_string())
            .part("file", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .context("sending OCR request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("OCR service returned {status}: {body}");
        }

        let parsed: OcrResponse = response.json().await.context("parsing OCR response")?;
        parsed.into_text()
    }
}

/// Extractor that reads the embedded text layer of a PDF locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract_text(&self, path: &Path) -> Result<Option<String>> {
        let path = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text(&path)
                .with_context(|| format!("extracting text from {}", path.display()))
        })
        .await
        .context("text extraction task failed")??;

        Ok(non_blank(text))
    }
}

fn non_blank(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
