//! Priority queue of pending uploads
//!
//! At most one task per local path is queued at any time. Tasks are served by
//! priority (lower first), then in the order they were enqueued.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::records::display_name;

/// Queue tier. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    /// User-initiated single-photo sync
    pub const MANUAL: Priority = Priority(0);
    /// Background discovery
    pub const BATCH: Priority = Priority(10);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::BATCH
    }
}

/// In-flight unit of upload work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoUploadTask {
    pub id: Uuid,
    pub file_path: PathBuf,
    pub filename: String,
    pub priority: Priority,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PhotoUploadTask {
    pub fn new(file_path: impl Into<PathBuf>, priority: Priority) -> Self {
        let file_path = file_path.into();
        Self {
            id: Uuid::new_v4(),
            filename: display_name(&file_path),
            file_path,
            priority,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

struct QueuedTask {
    seq: u64,
    task: PhotoUploadTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap: the most urgent task must compare greatest
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    paths: HashSet<PathBuf>,
    next_seq: u64,
}

/// Thread-safe upload queue with a bounded blocking dequeue
#[derive(Default)]
pub struct UploadQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns false if a task for the same path is already queued.
    pub fn enqueue(&self, task: PhotoUploadTask) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.paths.insert(task.file_path.clone()) {
                return false;
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueuedTask { seq, task });
        }

        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<PhotoUploadTask> {
        let mut inner = self.inner.lock();
        let queued = inner.heap.pop()?;
        inner.paths.remove(&queued.task.file_path);
        Some(queued.task)
    }

    /// Take the most urgent task, waiting up to `timeout` for one to arrive
    pub async fn dequeue(&self, timeout: Duration) -> Option<PhotoUploadTask> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so an enqueue in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pop() {
                return Some(task);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.lock().paths.contains(path)
    }

    /// Drop every queued task, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.heap.len();
        inner.heap.clear();
        inner.paths.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn task(name: &str, priority: Priority) -> PhotoUploadTask {
        PhotoUploadTask::new(PathBuf::from("/photos").join(name), priority)
    }

    #[tokio::test]
    async fn test_one_task_per_path() {
        let queue = UploadQueue::new();

        assert!(queue.enqueue(task("a.jpg", Priority::BATCH)));
        assert!(!queue.enqueue(task("a.jpg", Priority::MANUAL)));
        assert_eq!(queue.size(), 1);
        assert!(queue.contains(Path::new("/photos/a.jpg")));

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.priority, Priority::BATCH);
        assert!(!queue.contains(Path::new("/photos/a.jpg")));

        // Path may be queued again once it left the queue
        assert!(queue.enqueue(task("a.jpg", Priority::MANUAL)));
    }

    #[tokio::test]
    async fn test_manual_jumps_ahead_of_batch() {
        let queue = UploadQueue::new();
        for i in 0..5 {
            queue.enqueue(task(&format!("batch_{}.jpg", i), Priority::BATCH));
        }
        queue.enqueue(task("manual.jpg", Priority::MANUAL));

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.filename, "manual.jpg");

        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.filename, "batch_0.jpg");
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let queue = UploadQueue::new();
        let started = tokio::time::Instant::now();

        assert!(queue.dequeue(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(UploadQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(task("late.jpg", Priority::BATCH));

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.filename, "late.jpg");
    }

    #[test]
    fn test_clear() {
        let queue = UploadQueue::new();
        queue.enqueue(task("a.jpg", Priority::BATCH));
        queue.enqueue(task("b.jpg", Priority::BATCH));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(!queue.contains(Path::new("/photos/a.jpg")));
    }

    proptest! {
        #[test]
        fn prop_dequeue_order_is_priority_then_fifo(priorities in prop::collection::vec(0u8..4, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            let queue = UploadQueue::new();
            for (i, priority) in priorities.iter().enumerate() {
                let name = format!("{}.jpg", i);
                prop_assert!(queue.enqueue(task(&name, Priority(*priority))));
            }

            let mut expected: Vec<(u8, usize)> = priorities
                .iter()
                .enumerate()
                .map(|(i, priority)| (*priority, i))
                .collect();
            expected.sort();

            let mut actual = Vec::new();
            while let Some(task) = runtime.block_on(queue.dequeue(Duration::from_millis(1))) {
                let index: usize = task.filename.trim_end_matches(".jpg").parse().unwrap();
                actual.push((task.priority.0, index));
            }

            prop_assert_eq!(actual, expected);
        }
    }
}
