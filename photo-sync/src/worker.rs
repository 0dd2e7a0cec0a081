//! Background upload worker
//!
//! One worker task at a time drains the [`UploadQueue`], hands each photo to the
//! [`Transport`], applies the retry policy and records successes. The worker owns
//! no state of its own: everything it touches lives in a shared [`WorkerContext`]
//! so the service can observe and steer it between tasks.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::discovery;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::hasher::hash_file;
use crate::queue::{PhotoUploadTask, Priority, UploadQueue};
use crate::records::RecordStore;
use crate::state::{FailedUpload, SyncState, SyncStatus};
use crate::transport::{Transport, TransportError};

/// Why the worker was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StopReason {
    None = 0,
    Pause = 1,
    Disable = 2,
    Shutdown = 3,
}

impl StopReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StopReason::Pause,
            2 => StopReason::Disable,
            3 => StopReason::Shutdown,
            _ => StopReason::None,
        }
    }
}

/// State shared between the service handle and the worker task
pub(crate) struct WorkerContext {
    pub config: SyncConfig,
    pub transport: Arc<dyn Transport>,
    pub store: RecordStore,
    pub queue: UploadQueue,
    pub state: Mutex<SyncState>,
    pub events: EventBus,
    pub failed: Mutex<Vec<FailedUpload>>,
    stop: AtomicU8,
    stop_notify: Notify,
    rescan: AtomicBool,
}

impl WorkerContext {
    pub fn new(config: SyncConfig, transport: Arc<dyn Transport>) -> Self {
        let state = SyncState::new(config.enabled, config.auto_sync);

        Self {
            store: RecordStore::new(config.records_path()),
            config,
            transport,
            queue: UploadQueue::new(),
            state: Mutex::new(state),
            events: EventBus::new(),
            failed: Mutex::new(Vec::new()),
            stop: AtomicU8::new(StopReason::None as u8),
            stop_notify: Notify::new(),
            rescan: AtomicBool::new(false),
        }
    }

    /// Ask the running worker to stop at its next check
    pub fn request_stop(&self, reason: StopReason) {
        self.stop.store(reason as u8, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    pub fn clear_stop(&self) {
        self.stop.store(StopReason::None as u8, Ordering::SeqCst);
        self.rescan.store(false, Ordering::SeqCst);
    }

    pub fn pending_stop(&self) -> StopReason {
        StopReason::from_u8(self.stop.load(Ordering::SeqCst))
    }

    /// Withdraw a pause that the worker has not observed yet
    pub fn cancel_pause(&self) -> bool {
        self.stop
            .compare_exchange(
                StopReason::Pause as u8,
                StopReason::None as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn take_stop(&self) -> StopReason {
        StopReason::from_u8(self.stop.swap(StopReason::None as u8, Ordering::SeqCst))
    }

    pub fn request_rescan(&self) {
        self.rescan.store(true, Ordering::SeqCst);
    }

    /// Apply a transition on a locked state and announce it
    pub fn set_status(&self, state: &mut SyncState, to: SyncStatus) -> Result<()> {
        let from = state.transition(to)?;
        if from != to {
            info!(from = %from, to = %to, "Sync status changed");
            self.events.emit(SyncEvent::StatusChanged { from, to });
        }
        Ok(())
    }

    /// Escalate an unrecoverable condition to `Error`
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        error!(error = %message, "Sync engine entered error state");

        {
            let mut state = self.state.lock();
            state.last_error = Some(message.clone());
            // Any status may move to Error
            let _ = self.set_status(&mut state, SyncStatus::Error);
        }

        self.events.emit(SyncEvent::Error { message });
    }

    /// Move to `Authenticating` and tell observers credentials are needed
    pub fn require_authentication(&self) {
        {
            let mut state = self.state.lock();
            if state.status != SyncStatus::Authenticating {
                if let Err(e) = self.set_status(&mut state, SyncStatus::Authenticating) {
                    debug!(error = %e, "Not entering authenticating state");
                }
            }
        }

        warn!("Transport is not authenticated");
        self.events.emit(SyncEvent::AuthenticationRequired);
    }

    pub fn refresh_pending(&self) {
        let mut state = self.state.lock();
        state.photos_pending = self.queue.size();
    }

    /// Scan the photo directory and queue every unsynced photo at batch priority
    pub async fn discover(&self) -> Result<usize> {
        let filter = self.config.photo_filter()?;
        let root = fs::canonicalize(&self.config.photos_directory)
            .await
            .unwrap_or_else(|_| self.config.photos_directory.clone());

        let candidates = discovery::scan(&root, &filter, &self.store).await?;
        let found = candidates.len();
        let mut queued = 0;
        for candidate in candidates {
            if self.queue.enqueue(PhotoUploadTask::new(candidate.path, Priority::BATCH)) {
                queued += 1;
            }
        }

        self.refresh_pending();
        info!(directory = %root.display(), found, queued, "Discovered unsynced photos");
        Ok(queued)
    }

    fn record_failure(&self, task: &PhotoUploadTask, attempts: u32, error: &str) {
        let entry = FailedUpload {
            file_path: task.file_path.clone(),
            filename: task.filename.clone(),
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        };

        {
            let mut failed = self.failed.lock();
            failed.retain(|existing| existing.file_path != entry.file_path);
            failed.push(entry);
        }

        self.state.lock().total_failures += 1;
    }

    fn clear_failure(&self, path: &Path) {
        self.failed.lock().retain(|existing| existing.file_path != path);
    }
}

/// Per-run counters reported in `CycleCompleted`
#[derive(Debug, Default)]
struct CycleStats {
    uploaded: usize,
    failed: usize,
    skipped: usize,
}

impl CycleStats {
    fn processed(&self) -> usize {
        self.uploaded + self.failed
    }
}

enum TaskOutcome {
    Continue,
    Exit,
}

/// Worker entry point. Panics inside the run are caught and reported as `Error`.
pub(crate) async fn run(ctx: Arc<WorkerContext>, discover: bool) {
    let result = AssertUnwindSafe(run_loop(&ctx, discover)).catch_unwind().await;

    if let Err(panic) = result {
        ctx.fail(format!("Sync worker panicked: {}", panic_message(panic.as_ref())));
    }
}

async fn run_loop(ctx: &WorkerContext, discover: bool) {
    let mut cycle = CycleStats::default();
    debug!(discover, "Sync worker started");

    if discover {
        if let Err(e) = ctx.discover().await {
            ctx.fail(format!("Discovery failed: {}", e));
            return;
        }
    }

    loop {
        match ctx.take_stop() {
            StopReason::None => {}
            reason => {
                finish_stopped(ctx, reason, &cycle).await;
                return;
            }
        }

        if ctx.rescan.swap(false, Ordering::SeqCst) {
            if let Err(e) = ctx.discover().await {
                ctx.fail(format!("Discovery failed: {}", e));
                return;
            }
        }

        let task = tokio::select! {
            task = ctx.queue.dequeue(ctx.config.dequeue_timeout) => task,
            _ = ctx.stop_notify.notified() => continue,
        };

        let Some(task) = task else {
            if ctx.rescan.load(Ordering::SeqCst) || !ctx.queue.is_empty() {
                continue;
            }
            if finish_cycle(ctx, &cycle).await {
                return;
            }
            continue;
        };

        ctx.refresh_pending();

        if let TaskOutcome::Exit = process_task(ctx, task, &mut cycle).await {
            return;
        }
    }
}

async fn process_task(ctx: &WorkerContext, mut task: PhotoUploadTask, cycle: &mut CycleStats) -> TaskOutcome {
    let path = task.file_path.clone();

    let hash = match hash_file(&path).await {
        Ok(hash) => hash,
        Err(e) => {
            warn!(task_id = %task.id, path = %path.display(), error = %e, "Photo unreadable, skipping");
            cycle.skipped += 1;
            return TaskOutcome::Continue;
        }
    };

    if ctx.store.is_synced(&path, &hash) {
        debug!(task_id = %task.id, path = %path.display(), "Photo already synced, skipping");
        cycle.skipped += 1;
        return TaskOutcome::Continue;
    }

    let size = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

    info!(
        task_id = %task.id,
        path = %path.display(),
        attempt = task.retry_count + 1,
        "Uploading photo"
    );
    ctx.events.emit(SyncEvent::UploadStarted { path: path.clone() });

    match ctx.transport.upload(&path).await {
        Ok(receipt) => {
            ctx.store.record(&path, hash, size, receipt.cloud_id.clone());
            ctx.state.lock().record_success();
            ctx.clear_failure(&path);
            cycle.uploaded += 1;

            info!(task_id = %task.id, path = %path.display(), cloud_id = ?receipt.cloud_id, "Photo synced");
            ctx.events.emit(SyncEvent::PhotoSynced {
                path,
                cloud_id: receipt.cloud_id,
            });
            emit_progress(ctx, cycle);
            TaskOutcome::Continue
        }
        Err(TransportError::NotAuthenticated) => {
            requeue(ctx, task);

            if let Err(e) = ctx.store.save().await {
                error!(error = %e, "Failed to save sync records after authentication loss");
            }

            ctx.require_authentication();
            TaskOutcome::Exit
        }
        Err(TransportError::Terminal(message)) => {
            give_up(ctx, &task, task.retry_count + 1, &message, cycle);
            TaskOutcome::Continue
        }
        Err(TransportError::Retryable(message)) => {
            task.retry_count += 1;
            let attempt = task.retry_count;

            if task.retry_count > ctx.config.max_retry_attempts {
                give_up(ctx, &task, attempt, &message, cycle);
                return TaskOutcome::Continue;
            }

            let delay = ctx.config.backoff_delay(task.retry_count);
            warn!(
                task_id = %task.id,
                path = %path.display(),
                attempt,
                delay = ?delay,
                error = %message,
                "Upload failed, will retry"
            );
            ctx.events.emit(SyncEvent::UploadFailed {
                path,
                attempt,
                error: message,
                will_retry: true,
            });

            backoff(ctx, delay).await;
            requeue(ctx, task);
            TaskOutcome::Continue
        }
    }
}

/// Sleep for `delay`, waking early only for a stop request that is still pending
async fn backoff(ctx: &WorkerContext, delay: Duration) {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return,
            _ = ctx.stop_notify.notified() => {
                // Permits left over from a stop observed earlier are ignored
                if ctx.pending_stop() != StopReason::None {
                    return;
                }
            }
        }
    }
}

fn requeue(ctx: &WorkerContext, task: PhotoUploadTask) {
    let (task_id, retry_count) = (task.id, task.retry_count);
    let path = task.file_path.clone();

    if !ctx.queue.enqueue(task) {
        debug!(
            task_id = %task_id,
            path = %path.display(),
            retry_count,
            "Photo queued again meanwhile, dropping retry state"
        );
    }
    ctx.refresh_pending();
}

fn give_up(ctx: &WorkerContext, task: &PhotoUploadTask, attempts: u32, message: &str, cycle: &mut CycleStats) {
    error!(
        task_id = %task.id,
        path = %task.file_path.display(),
        attempts,
        error = %message,
        "Upload failed permanently"
    );

    ctx.record_failure(task, attempts, message);
    cycle.failed += 1;

    ctx.events.emit(SyncEvent::UploadFailed {
        path: task.file_path.clone(),
        attempt: attempts,
        error: message.to_string(),
        will_retry: false,
    });
    ctx.events.emit(SyncEvent::Error {
        message: format!("Failed to upload {}: {}", task.filename, message),
    });
    emit_progress(ctx, cycle);
}

fn emit_progress(ctx: &WorkerContext, cycle: &CycleStats) {
    let current = cycle.processed();
    ctx.events.emit(SyncEvent::Progress {
        current,
        total: current + ctx.queue.size(),
    });
}

/// Close out a pass whose queue ran dry. Returns false if work arrived meanwhile.
async fn finish_cycle(ctx: &WorkerContext, cycle: &CycleStats) -> bool {
    ctx.store.set_last_sync(Utc::now());

    if let Err(e) = ctx.store.save().await {
        ctx.fail(format!("Failed to save sync records: {}", e));
        return true;
    }

    {
        let mut state = ctx.state.lock();
        if !ctx.queue.is_empty() {
            return false;
        }

        // A pause that arrived while saving still wins over Idle
        let target = match ctx.take_stop() {
            StopReason::Pause => SyncStatus::Paused,
            _ => SyncStatus::Idle,
        };

        state.last_sync = ctx.store.last_sync();
        state.photos_pending = 0;
        if let Err(e) = ctx.set_status(&mut state, target) {
            warn!(error = %e, "Could not finish sync cycle");
        }
    }

    info!(
        uploaded = cycle.uploaded,
        failed = cycle.failed,
        skipped = cycle.skipped,
        "Sync cycle completed"
    );
    ctx.events.emit(SyncEvent::CycleCompleted {
        uploaded: cycle.uploaded,
        failed: cycle.failed,
        skipped: cycle.skipped,
    });
    true
}

async fn finish_stopped(ctx: &WorkerContext, reason: StopReason, cycle: &CycleStats) {
    if let Err(e) = ctx.store.save().await {
        error!(error = %e, "Failed to save sync records while stopping");
    }

    let target = match reason {
        StopReason::Pause => SyncStatus::Paused,
        _ => SyncStatus::Idle,
    };

    {
        let mut state = ctx.state.lock();
        state.photos_pending = ctx.queue.size();
        if let Err(e) = ctx.set_status(&mut state, target) {
            warn!(error = %e, "Could not apply stop request");
        }
    }

    info!(
        reason = ?reason,
        uploaded = cycle.uploaded,
        failed = cycle.failed,
        pending = ctx.queue.size(),
        "Sync worker stopped"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, MockOutcome, MockTransport};
    use tempfile::TempDir;

    #[test]
    fn test_stop_reason_round_trip() {
        let transport = Arc::new(MockTransport::new());
        let dirs = TempDir::new().unwrap();
        let ctx = WorkerContext::new(test_config(dirs.path()), transport);

        assert_eq!(ctx.pending_stop(), StopReason::None);
        ctx.request_stop(StopReason::Pause);
        assert_eq!(ctx.pending_stop(), StopReason::Pause);
        assert!(ctx.cancel_pause());
        assert_eq!(ctx.pending_stop(), StopReason::None);

        ctx.request_stop(StopReason::Disable);
        assert!(!ctx.cancel_pause());
        assert_eq!(ctx.take_stop(), StopReason::Disable);
        assert_eq!(ctx.pending_stop(), StopReason::None);
    }

    #[tokio::test]
    async fn test_panicking_transport_escalates_to_error() {
        let transport = Arc::new(MockTransport::new());
        transport.set_default(MockOutcome::Panic);
        let dirs = TempDir::new().unwrap();
        let config = test_config(dirs.path());
        fs::create_dir_all(&config.photos_directory).await.unwrap();
        fs::write(config.photos_directory.join("a.jpg"), b"a").await.unwrap();

        let ctx = Arc::new(WorkerContext::new(config, transport));
        let mut events = ctx.events.subscribe();
        ctx.state.lock().status = SyncStatus::Syncing;

        run(ctx.clone(), true).await;

        let state = ctx.state.lock().clone();
        assert_eq!(state.status, SyncStatus::Error);
        assert!(state.last_error.unwrap().contains("panicked"));

        let mut saw_error = false;
        while let Some(event) = events.try_recv() {
            if matches!(event, SyncEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_missing_photo_directory_escalates_to_error() {
        let transport = Arc::new(MockTransport::new());
        let dirs = TempDir::new().unwrap();
        let ctx = Arc::new(WorkerContext::new(test_config(dirs.path()), transport));
        ctx.state.lock().status = SyncStatus::Syncing;

        run(ctx.clone(), true).await;

        let state = ctx.state.lock().clone();
        assert_eq!(state.status, SyncStatus::Error);
        assert!(state.last_error.unwrap().contains("Discovery failed"));
    }

    #[tokio::test]
    async fn test_pause_during_final_save_ends_paused() {
        let transport = Arc::new(MockTransport::new());
        let dirs = TempDir::new().unwrap();
        let ctx = WorkerContext::new(test_config(dirs.path()), transport);
        ctx.state.lock().status = SyncStatus::Syncing;

        // Requested after the queue ran dry but before the cycle closed
        ctx.request_stop(StopReason::Pause);
        assert!(finish_cycle(&ctx, &CycleStats::default()).await);

        assert_eq!(ctx.state.lock().status, SyncStatus::Paused);
        assert_eq!(ctx.pending_stop(), StopReason::None);
        assert!(ctx.store.path().exists());
    }

    #[tokio::test]
    async fn test_backoff_ignores_stale_stop_permit() {
        let transport = Arc::new(MockTransport::new());
        let dirs = TempDir::new().unwrap();
        let ctx = WorkerContext::new(test_config(dirs.path()), transport);

        // A stop observed through the flag leaves its wake-up permit behind
        ctx.request_stop(StopReason::Pause);
        assert_eq!(ctx.take_stop(), StopReason::Pause);
        ctx.clear_stop();

        let started = tokio::time::Instant::now();
        backoff(&ctx, Duration::from_millis(200)).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_backoff_cut_short_by_pending_stop() {
        let transport = Arc::new(MockTransport::new());
        let dirs = TempDir::new().unwrap();
        let ctx = Arc::new(WorkerContext::new(test_config(dirs.path()), transport));

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                backoff(&ctx, Duration::from_secs(30)).await;
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.request_stop(StopReason::Shutdown);

        let elapsed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_refused_requeue_keeps_single_task() {
        let transport = Arc::new(MockTransport::new());
        let dirs = TempDir::new().unwrap();
        let ctx = WorkerContext::new(test_config(dirs.path()), transport);
        let path = dirs.path().join("a.jpg");

        assert!(ctx.queue.enqueue(PhotoUploadTask::new(path.clone(), Priority::MANUAL)));
        let mut retried = PhotoUploadTask::new(path.clone(), Priority::BATCH);
        retried.retry_count = 2;
        requeue(&ctx, retried);

        assert_eq!(ctx.queue.size(), 1);
        assert_eq!(ctx.state.lock().photos_pending, 1);
        let task = ctx.queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(task.priority, Priority::MANUAL);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");

        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
