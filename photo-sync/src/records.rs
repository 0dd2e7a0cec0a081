//! Durable record of which photos have been synced
//!
//! The store maps a local path to the last confirmed upload of that file and keeps
//! a secondary index by content hash, so a photo that was moved or renamed is still
//! recognised as synced. Memory is guarded by a single mutex; disk I/O happens only
//! in [`RecordStore::load`] and [`RecordStore::save`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// The durable fact "this local file, with this content, was synced"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSyncRecord {
    pub local_path: PathBuf,
    pub filename: String,
    pub sync_time: DateTime<Utc>,
    pub cloud_id: Option<String>,
    pub file_size: u64,
    pub file_hash: String,
}

/// Engine counters persisted next to the records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub total_photos_synced: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// On-disk layout of the record file
#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    records: BTreeMap<String, PhotoSyncRecord>,
    #[serde(default)]
    state: PersistedState,
}

#[derive(Debug, Default)]
struct RecordIndex {
    by_path: HashMap<PathBuf, PhotoSyncRecord>,
    by_hash: HashMap<String, PathBuf>,
    state: PersistedState,
}

impl RecordIndex {
    fn from_file(file: RecordFile) -> Self {
        let mut index = Self {
            state: file.state,
            ..Default::default()
        };

        for (_, record) in file.records {
            index.insert(record);
        }

        index
    }

    fn insert(&mut self, record: PhotoSyncRecord) {
        if let Some(previous) = self.by_path.get(&record.local_path) {
            if previous.file_hash != record.file_hash
                && self.by_hash.get(&previous.file_hash) == Some(&record.local_path)
            {
                self.by_hash.remove(&previous.file_hash);
            }
        }

        self.by_hash
            .insert(record.file_hash.clone(), record.local_path.clone());
        self.by_path.insert(record.local_path.clone(), record);
    }

    fn to_file(&self) -> RecordFile {
        RecordFile {
            records: self
                .by_path
                .iter()
                .map(|(path, record)| (path.to_string_lossy().into_owned(), record.clone()))
                .collect(),
            state: self.state.clone(),
        }
    }
}

/// Path-keyed store of [`PhotoSyncRecord`]s backed by a JSON file
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    index: Mutex<RecordIndex>,
    save_lock: tokio::sync::Mutex<()>,
}

impl RecordStore {
    /// Create an empty store persisted at `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Mutex::new(RecordIndex::default()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Location of the persisted file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory state with the persisted file.
    ///
    /// A missing file yields an empty store. A corrupt file also yields an empty
    /// store; it is logged and moved aside so the next save cannot overwrite it.
    pub async fn load(&self) {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No sync record file found, starting empty");
                *self.index.lock() = RecordIndex::default();
                return;
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read sync record file, starting empty");
                *self.index.lock() = RecordIndex::default();
                return;
            }
        };

        match serde_json::from_slice::<RecordFile>(&content) {
            Ok(file) => {
                let index = RecordIndex::from_file(file);
                info!(
                    path = %self.path.display(),
                    records = index.by_path.len(),
                    total_photos_synced = index.state.total_photos_synced,
                    "Loaded sync records"
                );
                *self.index.lock() = index;
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Sync record file is corrupt, starting empty");
                self.quarantine_corrupt_file().await;
                *self.index.lock() = RecordIndex::default();
            }
        }
    }

    async fn quarantine_corrupt_file(&self) {
        let mut quarantined = self.path.clone().into_os_string();
        quarantined.push(format!(".corrupt-{}", Utc::now().timestamp()));
        let quarantined = PathBuf::from(quarantined);

        match fs::rename(&self.path, &quarantined).await {
            Ok(()) => warn!(from = %self.path.display(), to = %quarantined.display(), "Moved corrupt record file aside"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to move corrupt record file aside"),
        }
    }

    /// True if `path` is recorded with `hash`, or any record carries `hash`
    pub fn is_synced(&self, path: &Path, hash: &str) -> bool {
        let index = self.index.lock();

        if let Some(record) = index.by_path.get(path) {
            if record.file_hash == hash {
                return true;
            }
        }

        index.by_hash.contains_key(hash)
    }

    /// Upsert the record for `path` and count it as a synced photo
    pub fn record(
        &self,
        path: &Path,
        hash: impl Into<String>,
        size: u64,
        cloud_id: Option<String>,
    ) -> PhotoSyncRecord {
        let record = PhotoSyncRecord {
            local_path: path.to_path_buf(),
            filename: display_name(path),
            sync_time: Utc::now(),
            cloud_id,
            file_size: size,
            file_hash: hash.into(),
        };

        let mut index = self.index.lock();
        index.insert(record.clone());
        index.state.total_photos_synced += 1;

        debug!(path = %path.display(), hash = %record.file_hash, "Recorded synced photo");
        record
    }

    /// Serialize the whole store and atomically replace the persisted file
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let content = {
            let index = self.index.lock();
            serde_json::to_vec_pretty(&index.to_file())?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::persistence_error(parent, format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            SyncError::persistence_error(&temp_path, format!("Failed to create temp file: {}", e))
        })?;
        file.write_all(&content).await.map_err(|e| {
            SyncError::persistence_error(&temp_path, format!("Failed to write records: {}", e))
        })?;
        file.sync_all().await.map_err(|e| {
            SyncError::persistence_error(&temp_path, format!("Failed to flush records: {}", e))
        })?;
        drop(file);

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            SyncError::persistence_error(&self.path, format!("Failed to replace record file: {}", e))
        })?;

        debug!(path = %self.path.display(), bytes = content.len(), "Saved sync records");
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<PhotoSyncRecord> {
        self.index.lock().by_path.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.lock().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_photos_synced(&self) -> u64 {
        self.index.lock().state.total_photos_synced
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.index.lock().state.last_sync
    }

    pub fn set_last_sync(&self, when: DateTime<Utc>) {
        self.index.lock().state.last_sync = Some(when);
    }

    /// Number of records confirmed on the given local calendar day
    pub fn synced_on(&self, day: NaiveDate) -> usize {
        self.index
            .lock()
            .by_path
            .values()
            .filter(|record| record.sync_time.with_timezone(&Local).date_naive() == day)
            .count()
    }
}

/// File name of `path` for display, falling back to the full path
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
