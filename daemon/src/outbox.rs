//! Local stand-in for the cloud upload client
//!
//! Uploads are copied into an outbox directory that an external uploader (or a
//! shared mount) picks up. The transport counts as authenticated while the
//! credentials file exists.

use async_trait::async_trait;
use photo_sync::{Transport, TransportError, UploadReceipt, UploadStats};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Credentials file not found: {0}")]
    MissingCredentials(PathBuf),

    #[error("Source photo not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to prepare outbox {path}: {source}")]
    Outbox { path: PathBuf, source: io::Error },

    #[error("Failed to copy {path} into outbox: {source}")]
    Copy { path: PathBuf, source: io::Error },
}

impl From<OutboxError> for TransportError {
    fn from(error: OutboxError) -> Self {
        match error {
            OutboxError::MissingCredentials(_) => TransportError::NotAuthenticated,
            OutboxError::SourceMissing(_) => TransportError::Terminal(error.to_string()),
            OutboxError::Outbox { .. } | OutboxError::Copy { .. } => {
                TransportError::Retryable(error.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
struct OutboxStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug)]
pub struct OutboxTransport {
    credentials_path: PathBuf,
    outbox_dir: PathBuf,
    stats: OutboxStats,
}

impl OutboxTransport {
    /// `album` becomes a subdirectory of `outbox_dir`
    pub fn new(credentials_path: PathBuf, outbox_dir: PathBuf, album: &str) -> Self {
        let outbox_dir = if album.is_empty() {
            outbox_dir
        } else {
            outbox_dir.join(album)
        };

        Self {
            credentials_path,
            outbox_dir,
            stats: OutboxStats::default(),
        }
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }

    async fn copy_to_outbox(&self, path: &Path) -> Result<UploadReceipt, OutboxError> {
        if !tokio::fs::try_exists(&self.credentials_path).await.unwrap_or(false) {
            return Err(OutboxError::MissingCredentials(self.credentials_path.clone()));
        }

        tokio::fs::create_dir_all(&self.outbox_dir)
            .await
            .map_err(|source| OutboxError::Outbox {
                path: self.outbox_dir.clone(),
                source,
            })?;

        let id = Uuid::new_v4().to_string();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "photo".to_string());
        let target = self.outbox_dir.join(format!("{}-{}", id, file_name));

        match tokio::fs::copy(path, &target).await {
            Ok(bytes) => {
                debug!(source = %path.display(), target = %target.display(), bytes, "Copied photo into outbox");
                Ok(UploadReceipt::with_id(id))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(OutboxError::SourceMissing(path.to_path_buf())),
            Err(source) => Err(OutboxError::Copy {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Transport for OutboxTransport {
    async fn is_authenticated(&self) -> bool {
        tokio::fs::try_exists(&self.credentials_path).await.unwrap_or(false)
    }

    async fn upload(&self, path: &Path) -> Result<UploadReceipt, TransportError> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        match self.copy_to_outbox(path).await {
            Ok(receipt) => {
                self.stats.successful.fetch_add(1, Ordering::Relaxed);
                info!(path = %path.display(), cloud_id = ?receipt.cloud_id, "Photo delivered to outbox");
                Ok(receipt)
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    fn upload_stats(&self) -> UploadStats {
        UploadStats {
            total: self.stats.total.load(Ordering::Relaxed),
            successful: self.stats.successful.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            queue_size: 0,
        }
    }
}
