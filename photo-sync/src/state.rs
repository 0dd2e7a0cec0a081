//! Engine status, its transition rules, and the live counters shown to callers

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::transport::UploadStats;

/// Overall engine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Paused,
    Error,
    Authenticating,
}

impl SyncStatus {
    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition_to(self, to: SyncStatus) -> bool {
        use SyncStatus::*;

        matches!(
            (self, to),
            (_, Error)
                | (Idle, Syncing)
                | (Idle, Authenticating)
                | (Idle, Paused)
                | (Syncing, Idle)
                | (Syncing, Paused)
                | (Syncing, Authenticating)
                | (Paused, Idle)
                | (Authenticating, Syncing)
                | (Authenticating, Idle)
                | (Error, Syncing)
                | (Error, Authenticating)
        )
    }

    /// Stable numeric code, used for gauges
    pub fn code(self) -> i64 {
        match self {
            SyncStatus::Idle => 0,
            SyncStatus::Syncing => 1,
            SyncStatus::Paused => 2,
            SyncStatus::Error => 3,
            SyncStatus::Authenticating => 4,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Paused => write!(f, "paused"),
            SyncStatus::Error => write!(f, "error"),
            SyncStatus::Authenticating => write!(f, "authenticating"),
        }
    }
}

/// Live, non-persisted engine state. Guarded by a single mutex in the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub photos_pending: usize,
    pub photos_synced_today: u64,
    pub total_photos_synced: u64,
    pub total_failures: u64,
    pub sync_enabled: bool,
    pub auto_sync: bool,
    /// Local day `photos_synced_today` refers to
    pub today: NaiveDate,
}

impl SyncState {
    pub fn new(sync_enabled: bool, auto_sync: bool) -> Self {
        Self {
            status: SyncStatus::Idle,
            last_sync: None,
            last_error: None,
            photos_pending: 0,
            photos_synced_today: 0,
            total_photos_synced: 0,
            total_failures: 0,
            sync_enabled,
            auto_sync,
            today: Local::now().date_naive(),
        }
    }

    /// Move to `to` if allowed. Returns the previous status.
    ///
    /// Entering `Error` keeps `last_error` as set by the caller; any other move
    /// leaves it untouched so the last failure stays visible in stats.
    pub fn transition(&mut self, to: SyncStatus) -> Result<SyncStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(SyncError::InvalidTransition { from, to });
        }

        self.status = to;
        Ok(from)
    }

    /// Count one successful upload, rolling the daily counter over at midnight
    pub fn record_success(&mut self) {
        self.roll_day(Local::now().date_naive());
        self.photos_synced_today += 1;
        self.total_photos_synced += 1;
    }

    /// Reset the daily counter when `day` differs from the tracked day
    pub fn roll_day(&mut self, day: NaiveDate) {
        if day != self.today {
            self.today = day;
            self.photos_synced_today = 0;
        }
    }
}

/// Ledger entry for a task that was given up on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUpload {
    pub file_path: PathBuf,
    pub filename: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Serializable snapshot returned by `SyncService::get_sync_stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub status: SyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub photos_pending: usize,
    pub photos_synced_today: u64,
    pub total_photos_synced: u64,
    pub total_failures: u64,
    pub sync_enabled: bool,
    pub auto_sync: bool,
    pub queue_size: usize,
    pub records: usize,
    pub failed_uploads: usize,
    pub upload_stats: UploadStats,
}

impl SyncStats {
    pub fn from_state(
        state: &SyncState,
        queue_size: usize,
        records: usize,
        failed_uploads: usize,
        upload_stats: UploadStats,
    ) -> Self {
        Self {
            status: state.status,
            last_sync: state.last_sync,
            last_error: state.last_error.clone(),
            photos_pending: state.photos_pending,
            photos_synced_today: state.photos_synced_today,
            total_photos_synced: state.total_photos_synced,
            total_failures: state.total_failures,
            sync_enabled: state.sync_enabled,
            auto_sync: state.auto_sync,
            queue_size,
            records,
            failed_uploads,
            upload_stats,
        }
    }
}
