use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use photo_sync::{PhotoFilter, Priority, SyncService};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;

/// Watches the capture directory and hands new photos to the engine once
/// their writes have settled
pub struct PhotoWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl PhotoWatcher {
    pub fn start(
        root: &Path,
        config: &WatcherConfig,
        filter: PhotoFilter,
        service: SyncService,
    ) -> Result<Self> {
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Watch path does not exist: {}", root.display()))?;

        let (event_tx, event_rx) = mpsc::channel(1000);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(e) = event_tx.try_send(event) {
                    warn!("Failed to forward file watcher event: {}", e);
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        })?;

        let mode = if config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&root, mode)?;

        info!(path = %root.display(), recursive = config.recursive, "Watching for new captures");

        let task = tokio::spawn(process_events(
            event_rx,
            root,
            filter,
            config.debounce,
            service,
        ));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
        debug!("Capture watcher stopped");
    }
}

async fn process_events(
    mut events: mpsc::Receiver<Event>,
    root: PathBuf,
    filter: PhotoFilter,
    window: Duration,
    service: SyncService,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.next_deadline();

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("File watcher event channel closed");
                    break;
                };

                if !is_capture_event(&event.kind) {
                    continue;
                }

                let now = Instant::now();
                for path in &event.paths {
                    if let Some(path) = capture_path(&root, &filter, path) {
                        debouncer.touch(path, now);
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(|| Instant::now() + window)), if deadline.is_some() => {
                for path in debouncer.take_ready(Instant::now()) {
                    if service.sync_photo(&path, Priority::MANUAL).await {
                        info!(path = %path.display(), "New capture queued");
                    } else {
                        debug!(path = %path.display(), "Capture not queued");
                    }
                }
            }
        }
    }

    // Anything still settling when the channel closes is picked up by the next scan
    if !debouncer.is_empty() {
        debug!(pending = debouncer.len(), "Dropping unsettled captures");
    }
}

fn is_capture_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// The path if it lies under `root` and passes the photo filter
fn capture_path(root: &Path, filter: &PhotoFilter, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() || !filter.matches(relative) {
        return None;
    }
    Some(path.to_path_buf())
}

/// Holds paths until no event has touched them for `window`
#[derive(Debug)]
struct Debouncer {
    pending: HashMap<PathBuf, Instant>,
    window: Duration,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
        }
    }

    fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().map(|last| *last + self.window)
    }

    /// Remove and return settled paths, oldest first
    fn take_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready: Vec<(PathBuf, Instant)> = self
            .pending
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= self.window)
            .map(|(path, last)| (path.clone(), *last))
            .collect();
        ready.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        for (path, _) in &ready {
            self.pending.remove(path);
        }
        ready.into_iter().map(|(path, _)| path).collect()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
