use anyhow::{Context, Result};
use photo_sync::{Priority, SyncService, SyncStats, SyncStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::DaemonConfig;
use crate::outbox::OutboxTransport;
use crate::telemetry::TelemetrySystem;
use crate::watcher::PhotoWatcher;

/// Hosts the sync engine together with the watcher and the metrics server
pub struct PhotoSyncDaemon {
    config: DaemonConfig,
    service: SyncService,
    telemetry: Option<TelemetrySystem>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl PhotoSyncDaemon {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;

        let transport = OutboxTransport::new(
            config.credentials_path(),
            config.outbox_path(),
            &config.transport.album_name,
        );
        let service = SyncService::new(config.sync.clone(), Arc::new(transport));

        Ok(Self {
            config,
            service,
            telemetry: None,
            tasks: Vec::new(),
        })
    }

    /// Attach the telemetry system, enabling event metrics and the HTTP server
    pub fn with_telemetry(mut self, telemetry: TelemetrySystem) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn service(&self) -> &SyncService {
        &self.service
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting photo sync daemon");

        tokio::fs::create_dir_all(&self.config.sync.photos_directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create photos directory {}",
                    self.config.sync.photos_directory.display()
                )
            })?;

        self.service.initialize().await?;

        if let Some(telemetry) = &self.telemetry {
            let recorder = telemetry.spawn_event_recorder(self.service.subscribe());
            self.tasks.push(("event_recorder", recorder));

            if telemetry.config().metrics.enabled {
                self.start_metrics_server();
            }
        }

        let watcher = if self.config.watcher.enabled {
            let filter = self.config.sync.photo_filter()?;
            Some(PhotoWatcher::start(
                &self.config.sync.photos_directory,
                &self.config.watcher,
                filter,
                self.service.clone(),
            )?)
        } else {
            None
        };

        // Catch up on anything captured while the daemon was down
        if !self.service.start_sync(false).await {
            warn!(status = %self.service.status(), "Initial sync did not start");
        }

        info!("Photo sync daemon started successfully");

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        } else {
            info!("Ctrl+C received, shutting down");
        }

        if let Some(watcher) = watcher {
            watcher.stop();
        }
        self.shutdown().await;
        info!("Photo sync daemon stopped");
        Ok(())
    }

    /// Run one discovery and upload pass, then stop
    pub async fn sync_once(&self, timeout: Duration) -> Result<SyncStats> {
        self.service.initialize().await?;

        if !self.service.start_sync(false).await {
            let status = self.service.status();
            self.service.shutdown().await;
            anyhow::bail!("Sync did not start (status: {})", status);
        }

        let outcome = self.wait_until_settled(timeout).await;
        let stats = self.service.get_sync_stats();
        self.service.shutdown().await;

        outcome?;
        Ok(stats)
    }

    /// Upload a single photo ahead of any other work, then stop
    pub async fn sync_photo(&self, path: &Path, timeout: Duration) -> Result<SyncStats> {
        self.service.initialize().await?;

        if !self.service.sync_photo(path, Priority::MANUAL).await {
            self.service.shutdown().await;
            anyhow::bail!(
                "{} was not queued: missing, not readable, or already synced",
                path.display()
            );
        }

        let outcome = self.wait_until_settled(timeout).await;
        let stats = self.service.get_sync_stats();
        self.service.shutdown().await;

        outcome?;
        Ok(stats)
    }

    /// Load persisted records and report stats without syncing
    pub async fn status(&self) -> Result<SyncStats> {
        self.service.initialize().await?;
        let stats = self.service.get_sync_stats();
        self.service.shutdown().await;
        Ok(stats)
    }

    async fn wait_until_settled(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.service.status() {
                SyncStatus::Syncing => {}
                SyncStatus::Idle | SyncStatus::Paused => return Ok(()),
                SyncStatus::Authenticating => {
                    anyhow::bail!(
                        "Credentials missing, expected {}",
                        self.config.credentials_path().display()
                    )
                }
                SyncStatus::Error => {
                    let message = self
                        .service
                        .get_sync_stats()
                        .last_error
                        .unwrap_or_else(|| "unknown error".to_string());
                    anyhow::bail!("Sync failed: {}", message)
                }
            }

            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("Sync still running after {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn start_metrics_server(&mut self) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };

        let metrics = &telemetry.config().metrics;
        let bind_addr = format!("{}:{}", metrics.bind_address, metrics.port);
        let app = telemetry.create_server(self.service.clone());

        let handle = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind metrics server to {}: {}", bind_addr, e);
                    return;
                }
            };
            info!("Metrics server listening on {}", bind_addr);

            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server failed: {}", e);
            }
        });

        self.tasks.push(("metrics_server", handle));
    }

    async fn shutdown(&mut self) {
        info!("Shutting down photo sync daemon");

        self.service.shutdown().await;

        for (name, handle) in self.tasks.drain(..) {
            debug!("Stopping task: {}", name);
            handle.abort();
        }
    }
}

impl Drop for PhotoSyncDaemon {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.sync.photos_directory = dir.path().join("photos");
        config.sync.data_directory = dir.path().join("data");
        config.sync.auto_sync = false;
        config.sync.dequeue_timeout = Duration::from_millis(50);
        config.telemetry.log_file_path = None;
        config.telemetry.metrics.enabled = false;
        config
    }

    async fn write_credentials(config: &DaemonConfig) {
        tokio::fs::create_dir_all(&config.sync.data_directory).await.unwrap();
        tokio::fs::write(config.credentials_path(), b"{}").await.unwrap();
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config_in(&temp_dir);
        config.sync.extensions.clear();

        assert!(PhotoSyncDaemon::new(config).is_err());
    }

    #[tokio::test]
    async fn test_sync_once_uploads_into_outbox() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        write_credentials(&config).await;
        tokio::fs::create_dir_all(&config.sync.photos_directory).await.unwrap();
        tokio::fs::write(config.sync.photos_directory.join("a.jpg"), b"one").await.unwrap();
        tokio::fs::write(config.sync.photos_directory.join("b.png"), b"two").await.unwrap();
        tokio::fs::write(config.sync.photos_directory.join("readme.txt"), b"skip").await.unwrap();

        let outbox = config.outbox_path().join(&config.transport.album_name);
        let daemon = PhotoSyncDaemon::new(config.clone()).unwrap();
        let stats = daemon.sync_once(Duration::from_secs(10)).await.unwrap();

        assert_eq!(stats.total_photos_synced, 2);
        assert_eq!(stats.records, 2);
        assert_eq!(std::fs::read_dir(&outbox).unwrap().count(), 2);
        assert!(config.sync.records_path().exists());

        // A fresh daemon sees the persisted records
        let daemon = PhotoSyncDaemon::new(config).unwrap();
        let stats = daemon.status().await.unwrap();
        assert_eq!(stats.total_photos_synced, 2);
        assert_eq!(stats.status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_sync_once_without_credentials_fails() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        tokio::fs::create_dir_all(&config.sync.photos_directory).await.unwrap();

        let daemon = PhotoSyncDaemon::new(config).unwrap();
        let error = daemon.sync_once(Duration::from_secs(5)).await.unwrap_err();

        assert!(error.to_string().contains("Sync did not start"));
        assert_eq!(daemon.service().status(), SyncStatus::Authenticating);
    }

    #[tokio::test]
    async fn test_sync_photo_rejects_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        write_credentials(&config).await;
        tokio::fs::create_dir_all(&config.sync.photos_directory).await.unwrap();

        let daemon = PhotoSyncDaemon::new(config.clone()).unwrap();
        let missing = config.sync.photos_directory.join("missing.jpg");

        assert!(daemon.sync_photo(&missing, Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_photo_uploads_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        write_credentials(&config).await;
        tokio::fs::create_dir_all(&config.sync.photos_directory).await.unwrap();
        let photo = config.sync.photos_directory.join("single.jpg");
        tokio::fs::write(&photo, b"single").await.unwrap();
        tokio::fs::write(config.sync.photos_directory.join("other.jpg"), b"other").await.unwrap();

        let daemon = PhotoSyncDaemon::new(config).unwrap();
        let stats = daemon.sync_photo(&photo, Duration::from_secs(10)).await.unwrap();

        assert_eq!(stats.total_photos_synced, 1);
        assert_eq!(stats.records, 1);
    }
}
