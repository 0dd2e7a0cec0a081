use anyhow::Result;
use photo_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Settings of the local outbox transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Credentials file, relative to the sync data directory unless absolute
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    /// Directory uploads are copied into, relative to the data directory unless absolute
    #[serde(default = "default_outbox_directory")]
    pub outbox_directory: PathBuf,
    /// Remote album photos are filed under
    #[serde(default = "default_album_name")]
    pub album_name: String,
}

/// Settings of the capture watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Quiet period after the last event on a file before it is queued
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            sync: SyncConfig {
                photos_directory: base.join("photos"),
                data_directory: base.join("data"),
                ..SyncConfig::default()
            },
            transport: TransportConfig::default(),
            watcher: WatcherConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            outbox_directory: default_outbox_directory(),
            album_name: default_album_name(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recursive: true,
            debounce: default_debounce(),
        }
    }
}

impl DaemonConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;

        if self.transport.credentials_file.as_os_str().is_empty() {
            anyhow::bail!("transport.credentials_file cannot be empty");
        }
        if self.transport.outbox_directory.as_os_str().is_empty() {
            anyhow::bail!("transport.outbox_directory cannot be empty");
        }
        if self.watcher.enabled && self.watcher.debounce.is_zero() {
            anyhow::bail!("watcher.debounce must be greater than zero");
        }

        self.telemetry.validate()?;

        Ok(())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.sync.data_directory.join(&self.transport.credentials_file)
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.sync.data_directory.join(&self.transport.outbox_directory)
    }
}

/// Config file used when `--config` is not given
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photo-sync")
        .join("photo-sync.toml")
}

fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photo-sync")
}

// Default value functions
fn default_true() -> bool { true }
fn default_debounce() -> Duration { Duration::from_secs(1) }
fn default_album_name() -> String { "Photobooth".to_string() }

fn default_credentials_file() -> PathBuf {
    PathBuf::from("google_credentials.json")
}

fn default_outbox_directory() -> PathBuf {
    PathBuf::from("outbox")
}
