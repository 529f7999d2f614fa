//! Word-processor to PDF conversion.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

/// Converts a document into a PDF next to it.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert `source` and return the path of the produced PDF.
    async fn convert_to_pdf(&self, source: &Path) -> Result<PathBuf>;
}

/// Converter backed by a headless LibreOffice (`soffice`) binary.
#[derive(Debug, Clone)]
pub struct SofficeConverter {
    binary: String,
}

impl SofficeConverter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SofficeConverter {
    fn default() -> Self {
        Self::new("soffice")
    }
}

#[async_trait]
impl DocumentConverter for SofficeConverter {
    async fn convert_to_pdf(&self, source: &Path) -> Result<PathBuf> {
        let out_dir = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let target = pdf_path_for(source)?;

        let output = Command::new(&self.binary)
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(out_dir)
            .arg(source)
            .output()
            .await
            .with_context(|| format!("executing {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("document conversion failed: {}", stderr.trim());
        }

        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            bail!("converter produced no output at {}", target.display());
        }

        tracing::debug!(source = %source.display(), target = %target.display(), "Converted document");
        Ok(target)
    }
}

/// `dir/report.docx` -> `dir/report.pdf`.
pub fn pdf_path_for(source: &Path) -> Result<PathBuf> {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .with_context(|| format!("no file name in {}", source.display()))?;
    Ok(source.with_file_name(format!("{stem}.pdf")))
}
