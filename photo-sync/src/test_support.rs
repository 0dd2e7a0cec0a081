//! Scripted transport and helpers shared by the engine tests

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::transport::{Transport, TransportError, UploadReceipt, UploadStats};

/// What the mock does on one upload call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    Retryable,
    Terminal,
    NotAuthenticated,
    Panic,
}

pub struct MockTransport {
    authenticated: AtomicBool,
    script: Mutex<VecDeque<MockOutcome>>,
    default: Mutex<MockOutcome>,
    delay: Mutex<Duration>,
    attempts: Mutex<Vec<PathBuf>>,
    completed: Mutex<Vec<PathBuf>>,
    stats: Mutex<UploadStats>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            authenticated: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(MockOutcome::Succeed),
            delay: Mutex::new(Duration::ZERO),
            attempts: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            stats: Mutex::new(UploadStats::default()),
        }
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Outcomes consumed one per call before falling back to the default
    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn set_default(&self, outcome: MockOutcome) {
        *self.default.lock() = outcome;
    }

    /// Time each upload takes
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every path passed to `upload`, in call order
    pub fn attempts(&self) -> Vec<PathBuf> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, path: &Path) -> usize {
        self.attempts.lock().iter().filter(|p| p.as_path() == path).count()
    }

    /// Paths whose upload call ran to completion
    pub fn completed(&self) -> Vec<PathBuf> {
        self.completed.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn upload(&self, path: &Path) -> Result<UploadReceipt, TransportError> {
        self.attempts.lock().push(path.to_path_buf());

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());

        self.completed.lock().push(path.to_path_buf());
        let mut stats = self.stats.lock();
        stats.total += 1;

        match outcome {
            MockOutcome::Succeed => {
                stats.successful += 1;
                Ok(UploadReceipt::with_id(format!("cloud-{}", stats.successful)))
            }
            MockOutcome::Retryable => {
                stats.failed += 1;
                Err(TransportError::Retryable("service unavailable".to_string()))
            }
            MockOutcome::Terminal => {
                stats.failed += 1;
                Err(TransportError::Terminal("unsupported media".to_string()))
            }
            MockOutcome::NotAuthenticated => {
                self.authenticated.store(false, Ordering::SeqCst);
                Err(TransportError::NotAuthenticated)
            }
            MockOutcome::Panic => {
                drop(stats);
                panic!("mock transport exploded");
            }
        }
    }

    fn upload_stats(&self) -> UploadStats {
        self.stats.lock().clone()
    }
}

/// Fast-cycling config rooted at `root/photos` and `root/data`
pub fn test_config(root: &Path) -> SyncConfig {
    SyncConfig {
        auto_sync: false,
        sync_interval: Duration::from_secs(3600),
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        dequeue_timeout: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        photos_directory: root.join("photos"),
        data_directory: root.join("data"),
        ..Default::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
