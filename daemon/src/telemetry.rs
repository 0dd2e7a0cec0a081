//! Telemetry module for logging and metrics collection
//!
//! This module provides:
//! - Structured logging with JSON and pretty formatters
//! - Log persistence to rolling local files
//! - Prometheus metrics fed from engine events
//! - An HTTP endpoint exposing metrics and the engine status

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use photo_sync::{EventChannel, SyncEvent, SyncService, SyncStats};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Enable console logging
    #[serde(default = "default_true")]
    pub console_logging: bool,
    /// Local log file path, JSON formatted
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,
    /// Log file rotation settings
    #[serde(default)]
    pub log_rotation: LogRotationConfig,
    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRotationConfig {
    /// Enable log rotation
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rotation frequency (daily, hourly)
    #[serde(default = "default_rotation_frequency")]
    pub frequency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the metrics and status server
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Server port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            console_logging: true,
            log_file_path: Some(PathBuf::from("logs/photo-syncd.log")),
            log_rotation: LogRotationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: default_rotation_frequency(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_metrics_port(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!("Unknown log level: {}", self.log_level);
        }
        if !["daily", "hourly", "never"].contains(&self.log_rotation.frequency.as_str()) {
            anyhow::bail!("Unknown log rotation frequency: {}", self.log_rotation.frequency);
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("telemetry.metrics.port must be set when metrics are enabled");
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_rotation_frequency() -> String { "daily".to_string() }
fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_metrics_port() -> u16 { 9187 }

/// Filter directives for the daemon and the engine at `level`
pub fn filter_directives(level: &str) -> String {
    let level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    format!("photo_syncd={level},photo_sync={level},tower_http={level}", level = level)
}

/// Prometheus metrics registry and collectors
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: Registry,

    pub photos_synced_total: IntCounter,
    pub upload_failures_total: IntCounterVec,
    pub upload_retries_total: IntCounter,
    pub sync_cycles_total: IntCounter,
    pub authentication_required_total: IntCounter,
    pub photos_pending: IntGauge,
    pub sync_status: IntGauge,
}

impl DaemonMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let photos_synced_total = IntCounter::new(
            "photo_sync_photos_synced_total",
            "Total number of photos uploaded",
        )?;

        let upload_failures_total = IntCounterVec::new(
            Opts::new("photo_sync_upload_failures_total", "Total number of failed upload attempts"),
            &["outcome"],
        )?;

        let upload_retries_total = IntCounter::new(
            "photo_sync_upload_retries_total",
            "Total number of uploads scheduled for retry",
        )?;

        let sync_cycles_total = IntCounter::new(
            "photo_sync_cycles_total",
            "Total number of completed sync cycles",
        )?;

        let authentication_required_total = IntCounter::new(
            "photo_sync_authentication_required_total",
            "Times the transport reported missing credentials",
        )?;

        let photos_pending = IntGauge::new(
            "photo_sync_photos_pending",
            "Photos waiting in the upload queue",
        )?;

        let sync_status = IntGauge::new(
            "photo_sync_status",
            "Engine status (0 idle, 1 syncing, 2 paused, 3 error, 4 authenticating)",
        )?;

        // Register all metrics
        registry.register(Box::new(photos_synced_total.clone()))?;
        registry.register(Box::new(upload_failures_total.clone()))?;
        registry.register(Box::new(upload_retries_total.clone()))?;
        registry.register(Box::new(sync_cycles_total.clone()))?;
        registry.register(Box::new(authentication_required_total.clone()))?;
        registry.register(Box::new(photos_pending.clone()))?;
        registry.register(Box::new(sync_status.clone()))?;

        Ok(Self {
            registry,
            photos_synced_total,
            upload_failures_total,
            upload_retries_total,
            sync_cycles_total,
            authentication_required_total,
            photos_pending,
            sync_status,
        })
    }

    /// Fold one engine event into the collectors
    pub fn record_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::StatusChanged { to, .. } => self.sync_status.set(to.code()),
            SyncEvent::Progress { current, total } => {
                self.photos_pending.set(total.saturating_sub(*current) as i64)
            }
            SyncEvent::PhotoSynced { .. } => self.photos_synced_total.inc(),
            SyncEvent::UploadFailed { will_retry: true, .. } => {
                self.upload_retries_total.inc();
                self.upload_failures_total.with_label_values(&["retry"]).inc();
            }
            SyncEvent::UploadFailed { will_retry: false, .. } => {
                self.upload_failures_total.with_label_values(&["dropped"]).inc();
            }
            SyncEvent::AuthenticationRequired => self.authentication_required_total.inc(),
            SyncEvent::CycleCompleted { .. } => {
                self.sync_cycles_total.inc();
                self.photos_pending.set(0);
            }
            SyncEvent::UploadStarted { .. } | SyncEvent::Error { .. } => {}
        }
    }

    /// Refresh gauges from a stats snapshot
    pub fn observe_stats(&self, stats: &SyncStats) {
        self.photos_pending.set(stats.queue_size as i64);
        self.sync_status.set(stats.status.code());
    }

    pub fn render(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Telemetry system for the daemon
pub struct TelemetrySystem {
    config: TelemetryConfig,
    metrics: DaemonMetrics,
    _file_guard: Option<WorkerGuard>,
}

#[derive(Clone)]
struct ServerState {
    metrics: DaemonMetrics,
    service: SyncService,
}

impl TelemetrySystem {
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        let metrics = DaemonMetrics::new()?;

        Ok(Self {
            config,
            metrics,
            _file_guard: None,
        })
    }

    pub fn initialize_logging(&mut self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter_directives(&self.config.log_level)));

        let registry = tracing_subscriber::registry().with(filter);

        // Console layer (pretty formatting)
        let console_layer = if self.config.console_logging {
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .pretty(),
            )
        } else {
            None
        };

        // File layer, always JSON
        let (file_layer, guard) = if let Some(log_path) = &self.config.log_file_path {
            let directory = log_path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("photo-syncd.log"));

            std::fs::create_dir_all(directory)?;

            let file_appender = if self.config.log_rotation.enabled {
                match self.config.log_rotation.frequency.as_str() {
                    "daily" => rolling::daily(directory, file_name),
                    "hourly" => rolling::hourly(directory, file_name),
                    _ => rolling::never(directory, file_name),
                }
            } else {
                rolling::never(directory, file_name)
            };

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            );
            (layer, Some(guard))
        } else {
            (None, None)
        };

        registry.with(console_layer).with(file_layer).try_init()?;
        self._file_guard = guard;

        info!(
            log_level = %self.config.log_level,
            log_file = ?self.config.log_file_path,
            "Telemetry system initialized"
        );

        Ok(())
    }

    /// Feed engine events into metrics and the log until the engine goes away
    pub fn spawn_event_recorder(&self, mut events: EventChannel) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                metrics.record_event(&event);

                match &event {
                    SyncEvent::Error { message } => warn!(error = %message, "Sync engine reported an error"),
                    SyncEvent::AuthenticationRequired => {
                        warn!("Photo uploads are waiting for credentials")
                    }
                    other => debug!(event = ?other, "Sync event"),
                }
            }
            debug!("Sync event stream closed");
        })
    }

    pub fn create_server(&self, service: SyncService) -> Router {
        let state = ServerState {
            metrics: self.metrics.clone(),
            service,
        };

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/status", get(status_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

/// Console-only logging for short-lived commands
pub fn init_basic_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level))),
        )
        .with(fmt::layer())
        .try_init()?;

    Ok(())
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    state.metrics.observe_stats(&state.service.get_sync_stats());

    match state.metrics.render() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn status_handler(State(state): State<ServerState>) -> Json<SyncStats> {
    Json(state.service.get_sync_stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use photo_sync::SyncStatus;

    #[test]
    fn test_events_update_metrics() {
        let metrics = DaemonMetrics::new().unwrap();

        metrics.record_event(&SyncEvent::StatusChanged {
            from: SyncStatus::Idle,
            to: SyncStatus::Syncing,
        });
        metrics.record_event(&SyncEvent::Progress { current: 1, total: 4 });
        metrics.record_event(&SyncEvent::PhotoSynced {
            path: PathBuf::from("/photos/a.jpg"),
            cloud_id: Some("abc".to_string()),
        });
        metrics.record_event(&SyncEvent::UploadFailed {
            path: PathBuf::from("/photos/b.jpg"),
            attempt: 1,
            error: "timeout".to_string(),
            will_retry: true,
        });
        metrics.record_event(&SyncEvent::UploadFailed {
            path: PathBuf::from("/photos/b.jpg"),
            attempt: 4,
            error: "timeout".to_string(),
            will_retry: false,
        });

        assert_eq!(metrics.sync_status.get(), 1);
        assert_eq!(metrics.photos_pending.get(), 3);
        assert_eq!(metrics.photos_synced_total.get(), 1);
        assert_eq!(metrics.upload_retries_total.get(), 1);
        assert_eq!(metrics.upload_failures_total.with_label_values(&["retry"]).get(), 1);
        assert_eq!(metrics.upload_failures_total.with_label_values(&["dropped"]).get(), 1);

        metrics.record_event(&SyncEvent::CycleCompleted {
            uploaded: 1,
            failed: 1,
            skipped: 0,
        });
        assert_eq!(metrics.sync_cycles_total.get(), 1);
        assert_eq!(metrics.photos_pending.get(), 0);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = DaemonMetrics::new().unwrap();
        metrics.record_event(&SyncEvent::AuthenticationRequired);

        let output = metrics.render().unwrap();
        assert!(output.contains("photo_sync_authentication_required_total 1"));
        assert!(output.contains("# TYPE photo_sync_status gauge"));
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives("DEBUG"),
            "photo_syncd=DEBUG,photo_sync=DEBUG,tower_http=DEBUG"
        );
        assert!(filter_directives("bogus").starts_with("photo_syncd=INFO"));
    }

    #[test]
    fn test_validate() {
        assert!(TelemetryConfig::default().validate().is_ok());

        let config = TelemetryConfig {
            log_rotation: LogRotationConfig {
                enabled: true,
                frequency: "weekly".to_string(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
