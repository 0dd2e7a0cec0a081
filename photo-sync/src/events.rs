//! Engine notifications for UI and host observers

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::SyncStatus;

/// Notification emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged {
        from: SyncStatus,
        to: SyncStatus,
    },
    Progress {
        current: usize,
        total: usize,
    },
    UploadStarted {
        path: PathBuf,
    },
    PhotoSynced {
        path: PathBuf,
        cloud_id: Option<String>,
    },
    UploadFailed {
        path: PathBuf,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    Error {
        message: String,
    },
    AuthenticationRequired,
    CycleCompleted {
        uploaded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Receiving end handed to a subscriber
pub struct EventChannel {
    receiver: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventChannel {
    /// Wait for the next event. `None` once the engine is dropped.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Fan-out of events to every live subscriber
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventChannel {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        EventChannel { receiver }
    }

    /// Deliver `event` to all subscribers, dropping those that hung up
    pub fn emit(&self, event: SyncEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(SyncEvent::Progress { current: 1, total: 3 });

        assert_eq!(first.recv().await, Some(SyncEvent::Progress { current: 1, total: 3 }));
        assert_eq!(second.recv().await, Some(SyncEvent::Progress { current: 1, total: 3 }));
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let mut kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.emit(SyncEvent::AuthenticationRequired);

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv(), Some(SyncEvent::AuthenticationRequired));
    }

    #[test]
    fn test_event_json_shape() {
        let event = SyncEvent::StatusChanged {
            from: SyncStatus::Idle,
            to: SyncStatus::Syncing,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["from"], "idle");
        assert_eq!(json["to"], "syncing");
    }
}
