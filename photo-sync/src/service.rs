//! Public entry point of the engine

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Local;
use parking_lot::Mutex;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::EventChannel;
use crate::hasher::hash_file;
use crate::queue::{PhotoUploadTask, Priority};
use crate::state::{FailedUpload, SyncStats, SyncStatus};
use crate::transport::Transport;
use crate::worker::{self, StopReason, WorkerContext};

struct ServiceInner {
    ctx: Arc<WorkerContext>,
    worker: Mutex<Option<JoinHandle<()>>>,
    trigger: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

/// Cloneable handle to the sync engine
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                ctx: Arc::new(WorkerContext::new(config, transport)),
                worker: Mutex::new(None),
                trigger: Mutex::new(None),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.ctx.config
    }

    /// Validate configuration, load the record store and start the periodic trigger.
    ///
    /// Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        ctx.config.validate()?;

        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        ctx.store.load().await;

        let auto_sync = {
            let mut state = ctx.state.lock();
            let today = Local::now().date_naive();
            state.total_photos_synced = ctx.store.total_photos_synced();
            state.last_sync = ctx.store.last_sync();
            state.today = today;
            state.photos_synced_today = ctx.store.synced_on(today) as u64;
            state.auto_sync
        };

        if auto_sync {
            self.start_trigger();
        }

        info!(
            photos_directory = %ctx.config.photos_directory.display(),
            records = ctx.store.len(),
            auto_sync,
            "Photo sync service initialized"
        );
        Ok(())
    }

    /// Begin a sync pass with discovery.
    ///
    /// With `force` while a pass is running, the running worker rescans instead of
    /// a second worker being started.
    pub async fn start_sync(&self, force: bool) -> bool {
        let ctx = &self.inner.ctx;

        {
            let state = ctx.state.lock();
            if !state.sync_enabled {
                debug!("Sync requested while disabled");
                return false;
            }
            match state.status {
                SyncStatus::Paused => {
                    debug!("Sync requested while paused");
                    return false;
                }
                SyncStatus::Syncing if force => {
                    info!("Forced sync requested during a running pass, rescanning");
                    ctx.request_rescan();
                    return true;
                }
                SyncStatus::Syncing => return false,
                _ => {}
            }
        }

        self.launch(true).await
    }

    /// Stop after the current upload. An idle engine pauses immediately.
    pub fn pause_sync(&self) -> bool {
        let ctx = &self.inner.ctx;
        let mut state = ctx.state.lock();

        match state.status {
            SyncStatus::Syncing => match ctx.pending_stop() {
                StopReason::None => {
                    info!("Pause requested, waiting for current upload");
                    ctx.request_stop(StopReason::Pause);
                    true
                }
                // A pending disable or shutdown wins over a pause
                pending => pending == StopReason::Pause,
            },
            SyncStatus::Idle => ctx.set_status(&mut state, SyncStatus::Paused).is_ok(),
            SyncStatus::Paused => true,
            _ => false,
        }
    }

    /// Leave `Paused` and continue any queued work without rediscovery
    pub async fn resume_sync(&self) -> bool {
        let ctx = &self.inner.ctx;

        let has_work = {
            let mut state = ctx.state.lock();
            match state.status {
                SyncStatus::Syncing => return ctx.cancel_pause(),
                SyncStatus::Paused => {
                    if ctx.set_status(&mut state, SyncStatus::Idle).is_err() {
                        return false;
                    }
                }
                _ => return false,
            }
            !ctx.queue.is_empty()
        };

        if has_work {
            self.launch(false).await;
        }
        true
    }

    /// Queue a single photo ahead of background work.
    ///
    /// Returns false if the file is missing, unreadable, already synced or
    /// already queued.
    pub async fn sync_photo(&self, path: impl AsRef<Path>, priority: Priority) -> bool {
        let ctx = &self.inner.ctx;
        let path = match fs::canonicalize(path.as_ref()).await {
            Ok(path) => path,
            Err(e) => {
                debug!(path = %path.as_ref().display(), error = %e, "Photo not found");
                return false;
            }
        };

        let hash = match hash_file(&path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot hash photo");
                return false;
            }
        };

        if ctx.store.is_synced(&path, &hash) {
            debug!(path = %path.display(), "Photo already synced");
            return false;
        }

        let start_worker = {
            let mut state = ctx.state.lock();
            if !ctx.queue.enqueue(PhotoUploadTask::new(path.clone(), priority)) {
                debug!(path = %path.display(), "Photo already queued");
                return false;
            }
            state.photos_pending = ctx.queue.size();

            state.sync_enabled
                && matches!(
                    state.status,
                    SyncStatus::Idle | SyncStatus::Error | SyncStatus::Authenticating
                )
        };

        info!(path = %path.display(), priority = priority.0, "Photo queued for sync");

        if start_worker {
            self.launch(false).await;
        }
        true
    }

    /// Turn syncing on or off. Disabling stops a running worker, which then ends `Idle`.
    pub fn enable_sync(&self, enabled: bool) {
        let ctx = &self.inner.ctx;
        let mut state = ctx.state.lock();
        state.sync_enabled = enabled;
        info!(enabled, "Sync enabled changed");

        if enabled {
            return;
        }

        match state.status {
            SyncStatus::Syncing => ctx.request_stop(StopReason::Disable),
            SyncStatus::Authenticating => {
                let _ = ctx.set_status(&mut state, SyncStatus::Idle);
            }
            _ => {}
        }
    }

    /// Start or stop the periodic trigger
    pub fn enable_auto_sync(&self, enabled: bool) {
        self.inner.ctx.state.lock().auto_sync = enabled;
        info!(enabled, "Auto sync changed");

        if enabled {
            if self.inner.initialized.load(Ordering::SeqCst) {
                self.start_trigger();
            }
        } else {
            self.stop_trigger();
        }
    }

    pub fn get_sync_stats(&self) -> SyncStats {
        let ctx = &self.inner.ctx;
        let queue_size = ctx.queue.size();
        let records = ctx.store.len();
        let failed_uploads = ctx.failed.lock().len();
        let upload_stats = ctx.transport.upload_stats();

        let mut state = ctx.state.lock();
        state.roll_day(Local::now().date_naive());
        SyncStats::from_state(&state, queue_size, records, failed_uploads, upload_stats)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.ctx.state.lock().status
    }

    pub fn subscribe(&self) -> EventChannel {
        self.inner.ctx.events.subscribe()
    }

    /// Uploads given up on since start, oldest first
    pub fn failed_uploads(&self) -> Vec<FailedUpload> {
        self.inner.ctx.failed.lock().clone()
    }

    /// Queue every failed upload again with a fresh retry budget
    pub async fn retry_failed_uploads(&self) -> usize {
        let ctx = &self.inner.ctx;
        let failed = self.failed_uploads();

        let (queued, start_worker) = {
            let mut state = ctx.state.lock();
            let mut queued = 0;
            for entry in failed {
                if ctx.queue.enqueue(PhotoUploadTask::new(entry.file_path, Priority::BATCH)) {
                    queued += 1;
                }
            }
            state.photos_pending = ctx.queue.size();

            let start_worker = queued > 0
                && state.sync_enabled
                && matches!(
                    state.status,
                    SyncStatus::Idle | SyncStatus::Error | SyncStatus::Authenticating
                );
            (queued, start_worker)
        };

        info!(queued, "Retrying failed uploads");

        if start_worker {
            self.launch(false).await;
        }
        queued
    }

    pub fn clear_failed_uploads(&self) -> usize {
        let mut failed = self.inner.ctx.failed.lock();
        let cleared = failed.len();
        failed.clear();
        cleared
    }

    /// Stop the worker (bounded wait), stop the trigger and force a save
    pub async fn shutdown(&self) {
        let ctx = &self.inner.ctx;
        info!("Shutting down photo sync service");

        self.inner.closed.store(true, Ordering::SeqCst);
        ctx.request_stop(StopReason::Shutdown);
        self.stop_trigger();

        let worker = self.inner.worker.lock().take();
        if let Some(mut handle) = worker {
            match tokio::time::timeout(ctx.config.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Sync worker joined"),
                Ok(Err(e)) => warn!(error = %e, "Sync worker ended abnormally"),
                Err(_) => {
                    warn!(timeout = ?ctx.config.shutdown_timeout, "Sync worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Err(e) = ctx.store.save().await {
            error!(error = %e, "Failed to save sync records during shutdown");
        }

        info!("Photo sync service stopped");
    }

    /// Enter `Syncing` and spawn the worker. At most one worker runs at a time.
    async fn launch(&self, discover: bool) -> bool {
        let ctx = &self.inner.ctx;

        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }

        if !ctx.transport.is_authenticated().await {
            ctx.require_authentication();
            return false;
        }

        {
            let mut state = ctx.state.lock();
            if !state.sync_enabled || state.status == SyncStatus::Syncing {
                return false;
            }
            if let Err(e) = ctx.set_status(&mut state, SyncStatus::Syncing) {
                debug!(error = %e, "Not starting sync worker");
                return false;
            }
            ctx.clear_stop();
        }

        let handle = tokio::spawn(worker::run(ctx.clone(), discover));
        *self.inner.worker.lock() = Some(handle);
        true
    }

    fn start_trigger(&self) {
        let mut trigger = self.inner.trigger.lock();
        if trigger.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let interval = self.inner.ctx.config.sync_interval;
        let weak = Arc::downgrade(&self.inner);
        *trigger = Some(tokio::spawn(run_trigger(weak, interval)));
        debug!(interval = ?interval, "Periodic sync trigger started");
    }

    fn stop_trigger(&self) {
        if let Some(handle) = self.inner.trigger.lock().take() {
            handle.abort();
            debug!("Periodic sync trigger stopped");
        }
    }
}

async fn run_trigger(weak: Weak<ServiceInner>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = weak.upgrade() else {
            break;
        };
        let service = SyncService { inner };

        let due = {
            let state = service.inner.ctx.state.lock();
            state.auto_sync && state.sync_enabled && state.status == SyncStatus::Idle
        };

        if due {
            debug!("Periodic sync triggered");
            service.start_sync(false).await;
        }
    }
}
