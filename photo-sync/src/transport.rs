//! The upload collaborator consumed by the engine
//!
//! The engine never talks to the network itself. A host process supplies an
//! implementation of [`Transport`] (the real cloud client, or the daemon's outbox).

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Successful upload acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Opaque remote identifier, if the service returns one
    pub cloud_id: Option<String>,
}

impl UploadReceipt {
    pub fn with_id(cloud_id: impl Into<String>) -> Self {
        Self {
            cloud_id: Some(cloud_id.into()),
        }
    }
}

/// Transport-side counters reported through `SyncStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub queue_size: usize,
}

/// Upload failure classes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Transient failure (network, rate limit, 5xx); the task may be retried
    #[error("Retryable upload error: {0}")]
    Retryable(String),

    /// Permanent failure for this file; retrying cannot help
    #[error("Terminal upload error: {0}")]
    Terminal(String),

    /// Credentials are missing or were revoked
    #[error("Transport is not authenticated")]
    NotAuthenticated,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

/// Authenticated upload client
#[async_trait]
pub trait Transport: Send + Sync {
    async fn is_authenticated(&self) -> bool;

    /// Upload one photo. This is the only call the worker waits on without a bound.
    async fn upload(&self, path: &Path) -> Result<UploadReceipt, TransportError>;

    fn upload_stats(&self) -> UploadStats;
}
