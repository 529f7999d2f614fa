//! Archive upload to external storage.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Acknowledgment returned by an uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub remote_name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored object.
    pub sha256: String,
}

impl UploadReceipt {
    /// Whether the receipt describes the given local digest.
    pub fn matches(&self, digest: &FileDigest) -> bool {
        self.size == digest.size && self.sha256.eq_ignore_ascii_case(&digest.sha256)
    }
}

/// Size and SHA-256 of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

/// Hash a file without loading it into memory.
pub async fn file_digest(path: &Path) -> Result<FileDigest> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let size = std::io::copy(&mut reader, &mut hasher)
            .with_context(|| format!("hashing {}", path.display()))?;
        Ok(FileDigest {
            size,
            sha256: hex::encode(hasher.finalize()),
        })
    })
    .await
    .context("hashing task failed")?
}

/// Ships a finished archive to external storage.
#[async_trait]
pub trait ArchiveUploader: Send + Sync {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<UploadReceipt>;
}

/// Copies archives into a directory (a mounted share, for instance).
#[derive(Debug, Clone)]
pub struct LocalDirUploader {
    dir: PathBuf,
}

impl LocalDirUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArchiveUploader for LocalDirUploader {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<UploadReceipt> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let target = self.dir.join(remote_name);
        tokio::fs::copy(local_path, &target)
            .await
            .with_context(|| format!("copying archive to {}", target.display()))?;

        // Digest the stored copy, not the source.
        let digest = file_digest(&target).await?;
        Ok(UploadReceipt {
            remote_name: remote_name.to_string(),
            size: digest.size,
            sha256: digest.sha256,
        })
    }
}

/// Uploads archives as multipart form posts.
///
/// The endpoint must answer with JSON `{"size": <bytes>, "sha256": "<hex>"}`
/// describing what it stored.
#[derive(Debug, Clone)]
pub struct HttpArchiveUploader {
    client: Client,
    url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredObject {
    #[serde(default)]
    name: Option<String>,
    size: u64,
    sha256: String,
}

impl HttpArchiveUploader {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building upload HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl ArchiveUploader for HttpArchiveUploader {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<UploadReceipt> {
        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;

        let part = Part::bytes(bytes)
            .file_name(remote_name.to_string())
            .mime_str("application/zip")
            .context("building upload part")?;
        let form = Form::new()
            .text("name", remote_name.to_string())
            .part("file", part);

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("sending archive upload")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("upload endpoint returned {status}: {body}");
        }

        let stored: StoredObject = response
            .json()
            .await
            .context("parsing upload acknowledgment")?;
        Ok(UploadReceipt {
            remote_name: stored.name.unwrap_or_else(|| remote_name.to_string()),
            size: stored.size,
            sha256: stored.sha256,
        })
    }
}
