//! Photo Sync Engine Library
//!
//! Background synchronization of kiosk captures to a cloud photo service:
//! - Discovery of unsynced photos with extension and glob filtering
//! - Content-hash deduplication against a durable record store
//! - Priority upload queue with retry and backoff
//! - A single background worker driving a pluggable [`Transport`]
//! - Status state machine and event notifications for the UI

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod filter;
pub mod hasher;
pub mod queue;
pub mod records;
pub mod service;
pub mod state;
pub mod transport;
mod worker;

// Re-export main types and functions
pub use config::SyncConfig;
pub use discovery::{scan, Candidate};
pub use error::{Result, SyncError};
pub use events::{EventChannel, SyncEvent};
pub use filter::{PhotoFilter, DEFAULT_PHOTO_EXTENSIONS};
pub use hasher::hash_file;
pub use queue::{PhotoUploadTask, Priority, UploadQueue};
pub use records::{PhotoSyncRecord, RecordStore};
pub use service::SyncService;
pub use state::{FailedUpload, SyncState, SyncStats, SyncStatus};
pub use transport::{Transport, TransportError, UploadReceipt, UploadStats};

// Test modules
#[cfg(test)]
mod test_support;
#[cfg(test)]
mod filter_tests;
