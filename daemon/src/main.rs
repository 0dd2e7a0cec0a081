use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use photo_sync::SyncStats;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

mod config;
mod daemon;
mod outbox;
mod telemetry;
mod watcher;

use config::DaemonConfig;
use daemon::PhotoSyncDaemon;
use telemetry::TelemetrySystem;

#[derive(Parser)]
#[command(name = "photo-syncd")]
#[command(about = "Photo sync daemon for camera kiosks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until Ctrl+C
    Run,
    /// Discover and upload pending photos once, then exit
    SyncOnce {
        /// Give up waiting after this long
        #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Upload a single photo, then exit
    SyncPhoto {
        path: PathBuf,

        #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Show persisted sync statistics
    Status {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
}

#[derive(Subcommand)]
enum ConfigActions {
    /// Validate configuration file
    Validate,
    /// Show current configuration
    Show,
    /// Generate default configuration
    Generate {
        /// Output path for configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let mut config = load_config(cli.config.as_deref()).await?;
            if let Some(level) = cli.log_level {
                config.telemetry.log_level = level;
            }
            run_daemon(config).await
        }
        Commands::SyncOnce { timeout } => {
            let config = load_oneshot_config(&cli.config, &cli.log_level).await?;
            let stats = PhotoSyncDaemon::new(config)?.sync_once(timeout).await?;
            print_stats(&stats);
            Ok(())
        }
        Commands::SyncPhoto { path, timeout } => {
            let config = load_oneshot_config(&cli.config, &cli.log_level).await?;
            let stats = PhotoSyncDaemon::new(config)?.sync_photo(&path, timeout).await?;
            println!("✓ {} synced", path.display());
            print_stats(&stats);
            Ok(())
        }
        Commands::Status { json } => {
            let config = load_oneshot_config(&cli.config, &cli.log_level).await?;
            let stats = PhotoSyncDaemon::new(config)?.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
            Ok(())
        }
        Commands::Config { action } => {
            telemetry::init_basic_logging(cli.log_level.as_deref().unwrap_or("warn"))?;
            match action {
                ConfigActions::Validate => validate_config(cli.config.as_deref()).await,
                ConfigActions::Show => show_config(cli.config.as_deref()).await,
                ConfigActions::Generate { output } => generate_config(output.as_deref()).await,
            }
        }
    }
}

/// Config for short-lived commands: console logging only, no periodic trigger
async fn load_oneshot_config(
    config_path: &Option<PathBuf>,
    log_level: &Option<String>,
) -> Result<DaemonConfig> {
    let mut config = load_config(config_path.as_deref()).await?;
    let level = log_level.clone().unwrap_or_else(|| config.telemetry.log_level.clone());
    telemetry::init_basic_logging(&level)?;

    config.sync.auto_sync = false;
    Ok(config)
}

async fn load_config(config_path: Option<&Path>) -> Result<DaemonConfig> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path);

    if tokio::fs::try_exists(&path).await? {
        DaemonConfig::load(&path).await
    } else if config_path.is_some() {
        anyhow::bail!("Configuration file not found: {}", path.display())
    } else {
        Ok(DaemonConfig::default())
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let mut telemetry = TelemetrySystem::new(config.telemetry.clone())?;
    telemetry.initialize_logging()?;

    info!("Starting photo sync daemon in foreground mode");
    PhotoSyncDaemon::new(config)?
        .with_telemetry(telemetry)
        .run()
        .await
}

fn print_stats(stats: &SyncStats) {
    println!("Status: {}", stats.status);
    println!("Sync enabled: {}", stats.sync_enabled);
    match stats.last_sync {
        Some(last_sync) => println!(
            "Last sync: {}",
            last_sync.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("Last sync: never"),
    }
    println!("Synced today: {}", stats.photos_synced_today);
    println!("Synced total: {}", stats.total_photos_synced);
    println!("Pending: {}", stats.photos_pending);
    println!("Failed uploads: {}", stats.failed_uploads);
    if let Some(error) = &stats.last_error {
        println!("Last error: {}", error);
    }
}

async fn validate_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path).await?;

    match config.validate() {
        Ok(()) => {
            println!("✓ Configuration is valid");
            println!("Photos directory: {}", config.sync.photos_directory.display());
            println!("Records file: {}", config.sync.records_path().display());
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path).await?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn generate_config(output_path: Option<&Path>) -> Result<()> {
    let config = DaemonConfig::default();

    if let Some(path) = output_path {
        config.save(path).await?;
        println!("Configuration generated at {}", path.display());
    } else {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}
