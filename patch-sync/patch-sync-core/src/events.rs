//! Per-path event channels.

use crate::patch::Patch;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WatchEvent {
    /// Disk content changed; `patch` turns the previous baseline into it.
    Change { path: PathBuf, patch: Patch },
    Delete { path: PathBuf },
    /// A change was emitted but could not be appended to the stream.
    PublishFailed { path: PathBuf, error: String },
    /// The watcher for `path` gave up.
    Stopped { path: PathBuf, reason: String },
}

impl WatchEvent {
    pub fn path(&self) -> &PathBuf {
        match self {
            WatchEvent::Change { path, .. }
            | WatchEvent::Delete { path }
            | WatchEvent::PublishFailed { path, .. }
            | WatchEvent::Stopped { path, .. } => path,
        }
    }
}

/// Broadcast channel for one watched path. Dropping the bus closes it for
/// every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WatchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }

    /// Deliver `event` to current subscribers. Never blocks; with nobody
    /// listening the event is dropped.
    pub fn send(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_the_bus_closes_receivers() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.send(WatchEvent::Delete {
            path: PathBuf::from("/tmp/a"),
        });
        drop(bus);
        assert!(matches!(rx.recv().await, Ok(WatchEvent::Delete { .. })));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
