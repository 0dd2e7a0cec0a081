//! Error types for the photo sync engine

use std::path::PathBuf;

use crate::state::SyncStatus;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path-related errors (missing photo directory, not a directory, ...)
    #[error("Path error at '{path}': {message}")]
    Path { path: PathBuf, message: String },

    /// Hash computation errors
    #[error("Hash computation error for '{path}': {message}")]
    Hash { path: PathBuf, message: String },

    /// Filter pattern errors
    #[error("Filter pattern error: {0}")]
    FilterPattern(String),

    /// Record store could not be read or written
    #[error("Persistence error at '{path}': {message}")]
    Persistence { path: PathBuf, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected state machine transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: SyncStatus, to: SyncStatus },

    /// Transport collaborator failures that escape task handling
    #[error("Transport error: {0}")]
    Transport(String),

    /// Generic errors with context
    #[error("Error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Create a new path error
    pub fn path_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new hash error
    pub fn hash_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Hash {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new persistence error
    pub fn persistence_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
