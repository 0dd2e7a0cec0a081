//! Configuration read by the sync engine

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::filter::{PhotoFilter, DEFAULT_PHOTO_EXTENSIONS};

/// Engine settings. Every field has a default so partial config sections parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Period of the automatic sync trigger
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,
    /// Retries after the first failed attempt before a task is dropped
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Double the delay for every further retry
    #[serde(default)]
    pub exponential_backoff: bool,
    #[serde(default = "default_max_retry_delay", with = "humantime_serde")]
    pub max_retry_delay: Duration,
    #[serde(default = "default_photos_directory")]
    pub photos_directory: PathBuf,
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// File name of the record store inside `data_directory`
    #[serde(default = "default_records_file")]
    pub records_file: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Longest single wait of the worker on an empty queue
    #[serde(default = "default_dequeue_timeout", with = "humantime_serde")]
    pub dequeue_timeout: Duration,
    /// Bound on joining the worker during shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sync: true,
            sync_interval: default_sync_interval(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay: default_retry_delay(),
            exponential_backoff: false,
            max_retry_delay: default_max_retry_delay(),
            photos_directory: default_photos_directory(),
            data_directory: default_data_directory(),
            records_file: default_records_file(),
            extensions: default_extensions(),
            exclude_patterns: Vec::new(),
            dequeue_timeout: default_dequeue_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl SyncConfig {
    /// Absolute location of the persisted record store
    pub fn records_path(&self) -> PathBuf {
        self.data_directory.join(&self.records_file)
    }

    /// Build the photo filter described by `extensions` and `exclude_patterns`
    pub fn photo_filter(&self) -> Result<PhotoFilter> {
        PhotoFilter::new(self.extensions.as_slice(), self.exclude_patterns.as_slice())
    }

    /// Delay before retry number `retry_count` (1-based)
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        if !self.exponential_backoff || retry_count <= 1 {
            return self.retry_delay.min(self.max_retry_delay);
        }

        let exponent = (retry_count - 1).min(16);
        self.retry_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.extensions.is_empty() {
            return Err(SyncError::config_error("sync.extensions cannot be empty"));
        }
        if self.sync_interval.is_zero() {
            return Err(SyncError::config_error("sync.sync_interval must be greater than zero"));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(SyncError::config_error("sync.dequeue_timeout must be greater than zero"));
        }
        if self.records_file.trim().is_empty() {
            return Err(SyncError::config_error("sync.records_file cannot be empty"));
        }

        // Surface bad globs at startup rather than on the first scan
        self.photo_filter()?;

        Ok(())
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_sync_interval() -> Duration { Duration::from_secs(300) } // 5 minutes
fn default_max_retry_attempts() -> u32 { 3 }
fn default_retry_delay() -> Duration { Duration::from_secs(60) }
fn default_max_retry_delay() -> Duration { Duration::from_secs(15 * 60) }
fn default_records_file() -> String { "sync_records.json".to_string() }
fn default_dequeue_timeout() -> Duration { Duration::from_secs(1) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(10) }

fn default_photos_directory() -> PathBuf {
    PathBuf::from("./photos")
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("./data")
}

fn default_extensions() -> Vec<String> {
    DEFAULT_PHOTO_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}
