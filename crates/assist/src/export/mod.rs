//! Bulk export and archival.
//!
//! One run renders every qualifying chat of every enabled assistant into
//! `<root>/EXP_ALL_CHAT/<YYYYMMDD>/<assistant-code>/<username>/`, zips the
//! date folder into `<root>/EXP_ALL_CHAT/<YYYYMMDD>.zip`, removes the folder,
//! uploads the archive and finally purges the conversation store.
//!
//! Runs are not idempotent and keep no checkpoint. Only one runs at a time.

mod archive;
mod pipeline;
mod upload;

use std::path::PathBuf;

use thiserror::Error;

pub use archive::compress_dir;
pub use pipeline::{EXPORT_DIR_NAME, ExportPipeline, ExportReport, ExportSettings};
pub use upload::{
    ArchiveUploader, FileDigest, HttpArchiveUploader, LocalDirUploader, UploadReceipt,
    file_digest,
};

/// Errors that abort an export run.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("an export is already running")]
    AlreadyRunning,

    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("report rendering failed: {0:#}")]
    Render(anyhow::Error),

    #[error("archive creation failed: {0:#}")]
    Archive(anyhow::Error),

    #[error("archive upload failed: {0:#}")]
    Upload(anyhow::Error),

    #[error("upload of {} could not be verified", archive.display())]
    UnverifiedUpload { archive: PathBuf },
}
