//! Discovery of local photos that still need uploading

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::filter::PhotoFilter;
use crate::hasher::hash_file;
use crate::records::{display_name, RecordStore};

/// A photo on disk with no up-to-date sync record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub filename: String,
    pub hash: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Walk `directory` and return every matching photo not yet synced, newest first.
///
/// Unreadable entries are logged and skipped. Only a missing or non-directory
/// root is an error.
pub async fn scan(directory: &Path, filter: &PhotoFilter, store: &RecordStore) -> Result<Vec<Candidate>> {
    if !directory.exists() {
        return Err(SyncError::path_error(directory, "Photo directory does not exist"));
    }

    if !directory.is_dir() {
        return Err(SyncError::path_error(directory, "Photo path is not a directory"));
    }

    let mut candidates = Vec::new();
    let mut already_synced = 0usize;

    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(directory).unwrap_or(path);
        if !filter.matches(relative) {
            continue;
        }

        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read metadata, skipping");
                continue;
            }
        };

        let hash = match hash_file(path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to hash photo, skipping");
                continue;
            }
        };

        if store.is_synced(path, &hash) {
            already_synced += 1;
            continue;
        }

        candidates.push(Candidate {
            path: path.to_path_buf(),
            filename: display_name(path),
            hash,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    candidates.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));

    debug!(
        directory = %directory.display(),
        candidates = candidates.len(),
        already_synced,
        "Discovery finished"
    );

    Ok(candidates)
}
