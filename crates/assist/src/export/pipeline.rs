//! The export run.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::ExportError;
use super::archive::compress_dir;
use super::upload::{ArchiveUploader, file_digest};
use crate::ingest::sanitize_filename;
use crate::report::{ReportRenderer, report_file_name};
use crate::store::{AssistantRecord, ConversationRepository, ExportChat, ExportScope, RecordCounts};

/// Folder under the export root holding dated trees and archives.
pub const EXPORT_DIR_NAME: &str = "EXP_ALL_CHAT";

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub root: PathBuf,
    /// Purge only after the uploader confirmed size and SHA-256.
    pub require_verified_upload: bool,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub archive_path: PathBuf,
    pub message_count: u64,
    pub report_count: u64,
    pub folder_removed: bool,
    pub uploaded: bool,
    /// Rows deleted by the purge, if it ran.
    pub purged: Option<RecordCounts>,
}

#[derive(Debug, Default)]
struct RenderTotals {
    reports: u64,
    messages: u64,
}

/// Sequential export job. Cloning shares the single-run guard.
#[derive(Clone)]
pub struct ExportPipeline {
    repo: ConversationRepository,
    renderer: Arc<dyn ReportRenderer>,
    uploader: Arc<dyn ArchiveUploader>,
    settings: ExportSettings,
    running: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ExportPipeline {
    pub fn new(
        repo: ConversationRepository,
        renderer: Arc<dyn ReportRenderer>,
        uploader: Arc<dyn ArchiveUploader>,
        settings: ExportSettings,
    ) -> Self {
        Self {
            repo,
            renderer,
            uploader,
            settings,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn export_dir(&self) -> PathBuf {
        self.settings.root.join(EXPORT_DIR_NAME)
    }

    /// Run an export dated today (server local time).
    pub async fn run(&self) -> Result<ExportReport, ExportError> {
        self.run_for_date(Local::now().date_naive()).await
    }

    /// Run an export whose folder and archive are named after `date`.
    #[instrument(skip(self), fields(date = %date))]
    pub async fn run_for_date(&self, date: NaiveDate) -> Result<ExportReport, ExportError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| ExportError::AlreadyRunning)?;

        let stamp = date.format("%Y%m%d").to_string();
        let export_dir = self.export_dir();
        let date_dir = export_dir.join(&stamp);
        tokio::fs::create_dir_all(&date_dir).await?;

        let scope = self
            .repo
            .snapshot_export_scope()
            .await
            .map_err(ExportError::Storage)?;
        info!(dir = %date_dir.display(), "Starting export");
        let totals = self.render_tree(&date_dir, &scope).await?;

        let archive_name = format!("{stamp}.zip");
        let archive_path = export_dir.join(&archive_name);
        let files = compress_dir(&date_dir, &archive_path)
            .await
            .map_err(ExportError::Archive)?;
        info!(archive = %archive_path.display(), files, "Archive written");

        // Folder removal and upload do not depend on each other.
        let folder_removed = match tokio::fs::remove_dir_all(&date_dir).await {
            Ok(()) => true,
            Err(e) => {
                warn!(dir = %date_dir.display(), error = %e, "Failed to remove export folder");
                false
            }
        };

        let receipt = self.uploader.upload(&archive_path, &archive_name).await;
        let local = file_digest(&archive_path)
            .await
            .map_err(ExportError::Archive)?;

        let uploaded = match &receipt {
            Ok(receipt) if receipt.matches(&local) => true,
            Ok(receipt) => {
                warn!(
                    remote_size = receipt.size,
                    local_size = local.size,
                    "Upload acknowledgment does not match the archive"
                );
                false
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Archive upload failed");
                false
            }
        };

        if !uploaded && self.settings.require_verified_upload {
            return Err(match receipt {
                Err(e) => ExportError::Upload(e),
                Ok(_) => ExportError::UnverifiedUpload {
                    archive: archive_path,
                },
            });
        }

        let purged = self
            .repo
            .purge_scope(&scope)
            .await
            .map_err(ExportError::Storage)?;
        info!(
            reports = totals.reports,
            messages = totals.messages,
            uploads = purged.uploads,
            chats = purged.chats,
            sessions = purged.sessions,
            "Export complete, store purged"
        );

        Ok(ExportReport {
            archive_path,
            message_count: totals.messages,
            report_count: totals.reports,
            folder_removed,
            uploaded,
            purged: Some(purged),
        })
    }

    /// Render the chats in `scope`, each cut at its captured last message.
    async fn render_tree(
        &self,
        date_dir: &Path,
        scope: &ExportScope,
    ) -> Result<RenderTotals, ExportError> {
        let assistants = self
            .repo
            .list_enabled_assistants()
            .await
            .map_err(ExportError::Storage)?;
        let mut totals = RenderTotals::default();

        for assistant in assistants {
            let assistant_dir = date_dir.join(path_segment(&assistant.code));
            tokio::fs::create_dir_all(&assistant_dir).await?;

            let chats = self
                .repo
                .list_export_chats(&assistant.id)
                .await
                .map_err(ExportError::Storage)?;

            let mut seq = 1;
            for mut chat in chats {
                let Some(last_seq) = scope.last_seq(&chat.chat.id) else {
                    continue;
                };
                chat.messages.retain(|m| m.seq <= last_seq);

                let user_dir = assistant_dir.join(path_segment(&chat.username));
                tokio::fs::create_dir_all(&user_dir).await?;

                if !chat.qualifies() {
                    continue;
                }

                let file_name =
                    report_file_name(chat.chat.created(), seq, self.renderer.extension());
                let messages = chat.messages.len() as u64;
                self.write_report(user_dir.join(file_name), &assistant, chat)
                    .await?;

                seq += 1;
                totals.reports += 1;
                totals.messages += messages;
            }

            info!(assistant = %assistant.code, reports = seq - 1, "Assistant exported");
        }

        Ok(totals)
    }

    async fn write_report(
        &self,
        path: PathBuf,
        assistant: &AssistantRecord,
        chat: ExportChat,
    ) -> Result<(), ExportError> {
        let renderer = self.renderer.clone();
        let assistant_name = assistant.display_name.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let file =
                File::create(&path).with_context(|| format!("creating {}", path.display()))?;
            let mut sink = BufWriter::new(file);
            renderer.render(&mut sink, &chat.chat, &assistant_name, &chat.messages)?;
            sink.flush().context("flushing report")?;
            Ok(())
        })
        .await
        .map_err(|e| ExportError::Render(e.into()))?
        .map_err(ExportError::Render)
    }
}

/// A safe single path component for assistant codes and usernames.
fn path_segment(name: &str) -> String {
    sanitize_filename(name).unwrap_or_else(|| "unknown".to_string())
}
