//! Typed notifications broadcast to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How a cycle changed one local event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityChange {
    /// Inserted from a remote-only event.
    Created,
    /// Overwritten with remote content.
    Updated,
    /// Removed because it vanished remotely or its delete committed.
    Removed,
    /// A local action was confirmed by the remote.
    Synced,
    /// Flagged after a terminal push failure.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotification {
    CycleStarted {
        is_full_sync: bool,
        queue_len: usize,
    },
    CycleCompleted {
        completed_at: DateTime<Utc>,
        queue_len: usize,
    },
    CycleAborted {
        error: String,
    },
    EntityChanged {
        local_id: String,
        change: EntityChange,
    },
    ActionDeadLettered {
        action_id: String,
        entity_id: String,
        error: String,
    },
}

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast fan-out. Sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    pub fn send(&self, notification: SyncNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn entity(&self, local_id: &str, change: EntityChange) {
        self.send(SyncNotification::EntityChanged {
            local_id: local_id.to_string(),
            change,
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.send(SyncNotification::CycleStarted {
            is_full_sync: true,
            queue_len: 2,
        });
        notifier.entity("e1", EntityChange::Synced);

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncNotification::CycleStarted {
                is_full_sync: true,
                queue_len: 2
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncNotification::EntityChanged {
                local_id: "e1".into(),
                change: EntityChange::Synced
            }
        );
    }

    #[test]
    fn send_without_subscribers_is_fine() {
        Notifier::new().send(SyncNotification::CycleAborted { error: "offline".into() });
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(SyncNotification::EntityChanged {
            local_id: "e1".into(),
            change: EntityChange::Removed,
        })
        .unwrap();
        assert_eq!(json["type"], "entity_changed");
        assert_eq!(json["change"], "removed");
    }
}
