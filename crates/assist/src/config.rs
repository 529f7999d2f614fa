//! Application configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/assist/config.toml` (created with defaults on
//! first run) and overridden by `ASSIST__SECTION__KEY` environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assistant::AssistantConfig;
use crate::chat::{ChatSettings, DEFAULT_CONTEXT_INSTRUCTION, RetryConfig};
use crate::export::{ArchiveUploader, ExportSettings, HttpArchiveUploader, LocalDirUploader};
use crate::ingest::{OcrSpaceExtractor, PdfTextExtractor, TextExtractor};

pub const APP_NAME: &str = "assist";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub chat: ChatConfig,
    pub ingest: IngestConfig,
    pub export: ExportConfig,
    /// Directory holding assistant prompt files. Defaults to `<data_dir>/prompts`.
    pub prompts_dir: Option<String>,
    /// CORS origins. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
    pub assistants: Vec<AssistantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Upstream model provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Connect timeout for upstream calls. Streams themselves are unbounded.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: ChatSettings::default().model,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub context_instruction: String,
    pub include_ocr_in_context: bool,
    /// Where multipart uploads land. Defaults to `<data_dir>/uploads`.
    pub upload_dir: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_instruction: DEFAULT_CONTEXT_INSTRUCTION.to_string(),
            include_ocr_in_context: false,
            upload_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Hosted OCR service.
    #[default]
    OcrSpace,
    /// Local text-layer extraction, PDFs only.
    PdfText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub extractor: ExtractorKind,
    pub ocr_url: String,
    pub ocr_api_key: String,
    pub ocr_language: String,
    pub ocr_engine: u8,
    pub ocr_timeout_secs: u64,
    pub soffice_binary: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorKind::OcrSpace,
            ocr_url: "https://api.ocr.space/parse/image".to_string(),
            ocr_api_key: String::new(),
            ocr_language: "eng".to_string(),
            ocr_engine: 2,
            ocr_timeout_secs: 120,
            soffice_binary: "soffice".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn build_extractor(&self) -> Result<Arc<dyn TextExtractor>> {
        Ok(match self.extractor {
            ExtractorKind::OcrSpace => {
                if self.ocr_api_key.is_empty() {
                    bail!("ingest.ocr_api_key must be set for the ocr_space extractor");
                }
                Arc::new(OcrSpaceExtractor::new(
                    &self.ocr_url,
                    &self.ocr_api_key,
                    &self.ocr_language,
                    self.ocr_engine,
                    Duration::from_secs(self.ocr_timeout_secs),
                )?)
            }
            ExtractorKind::PdfText => Arc::new(PdfTextExtractor),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Export root. Defaults to `<data_dir>`.
    pub root: Option<String>,
    /// Product name in the report footer.
    pub footer: String,
    pub require_verified_upload: bool,
    pub uploader: UploaderConfig,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            root: None,
            footer: "Assist".to_string(),
            require_verified_upload: true,
            uploader: UploaderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploaderKind {
    /// Copy archives into a directory (a mounted share, typically).
    #[default]
    Local,
    /// POST archives to an HTTP endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub kind: UploaderKind,
    /// Target directory for `local`. Defaults to `<state_dir>/archive`.
    pub dir: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            kind: UploaderKind::Local,
            dir: None,
            url: None,
            token: None,
            timeout_secs: 600,
        }
    }
}

/// Placeholder shown instead of configured secrets.
const REDACTED: &str = "<redacted>";

fn mask(secret: &mut String) {
    if !secret.is_empty() {
        *secret = REDACTED.to_string();
    }
}

impl AppConfig {
    /// Copy with API keys and tokens masked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        mask(&mut config.ingest.ocr_api_key);
        if let Some(token) = config.export.uploader.token.as_mut() {
            mask(token);
        }
        for assistant in &mut config.assistants {
            mask(&mut assistant.api_key);
        }
        config
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            model: self.llm.model.clone(),
            context_instruction: self.chat.context_instruction.clone(),
            include_ocr_in_context: self.chat.include_ocr_in_context,
            retry: self.retry.clone(),
        }
    }

    pub fn export_settings(&self, paths: &AppPaths) -> Result<ExportSettings> {
        Ok(ExportSettings {
            root: resolve_dir(self.export.root.as_deref(), || paths.data_dir.clone())?,
            require_verified_upload: self.export.require_verified_upload,
        })
    }

    pub fn upload_dir(&self, paths: &AppPaths) -> Result<PathBuf> {
        resolve_dir(self.chat.upload_dir.as_deref(), || {
            paths.data_dir.join("uploads")
        })
    }

    pub fn prompts_dir(&self, paths: &AppPaths) -> Result<PathBuf> {
        resolve_dir(self.prompts_dir.as_deref(), || paths.data_dir.join("prompts"))
    }

    pub fn build_uploader(&self, paths: &AppPaths) -> Result<Arc<dyn ArchiveUploader>> {
        let uploader = &self.export.uploader;
        Ok(match uploader.kind {
            UploaderKind::Local => {
                let dir = resolve_dir(uploader.dir.as_deref(), || {
                    paths.state_dir.join("archive")
                })?;
                Arc::new(LocalDirUploader::new(dir))
            }
            UploaderKind::Http => {
                let url = uploader
                    .url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| anyhow!("export.uploader.url must be set for the http uploader"))?;
                Arc::new(HttpArchiveUploader::new(
                    url,
                    uploader.token.clone(),
                    Duration::from_secs(uploader.timeout_secs),
                )?)
            }
        })
    }
}

fn resolve_dir(configured: Option<&str>, fallback: impl FnOnce() -> PathBuf) -> Result<PathBuf> {
    match configured.filter(|p| !p.trim().is_empty()) {
        Some(path) => expand_str_path(path),
        None => Ok(fallback()),
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("assist.db")
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}

/// Load the config file (writing defaults first if missing) plus env overrides.
pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing config {}", paths.config_file.display()))
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    body.push_str(EXAMPLE_ASSISTANT);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n",
        path.display()
    )
}

const EXAMPLE_ASSISTANT: &str = r#"
# Assistants are declared as an array of tables:
#
# [[assistants]]
# id = "hr"
# code = "HR"
# display_name = "HR Assistant"
# system_prompt_file = "hr.txt"
# vector_store_id = "vs_123,vs_456"
# api_key = "sk-..."
# first_reply_is_document = false
"#;

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
