//! Conflict resolution between a pending local action and the remote copy.
//!
//! Local-preferred last-write-wins: a local edit beats a concurrent remote
//! edit, except that a remote edit newer than a local delete keeps the event
//! alive.

use chrono::{DateTime, Utc};

use crate::sync::types::ActionType;

/// Which side survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Push the local action.
    ApplyLocal,
    /// Keep the remote version; the local action is dropped as synchronized.
    KeepRemote,
}

/// Decide between a local action stamped `local_at` and a remote copy
/// last modified at `remote_updated`, given the entity's `last_synced_at`.
pub fn resolve(
    action_type: ActionType,
    local_at: DateTime<Utc>,
    remote_updated: DateTime<Utc>,
    last_synced_at: Option<DateTime<Utc>>,
) -> Resolution {
    match last_synced_at {
        // Remote unchanged since our last sync.
        Some(baseline) if remote_updated <= baseline => Resolution::ApplyLocal,
        // Both sides changed.
        Some(_) => {
            if action_type == ActionType::Delete && remote_updated > local_at {
                Resolution::KeepRemote
            } else {
                Resolution::ApplyLocal
            }
        }
        // No baseline to compare against.
        None => newer_wins(local_at, remote_updated),
    }
}

/// Plain LWW; ties go to the local side.
pub fn newer_wins(local_at: DateTime<Utc>, remote_updated: DateTime<Utc>) -> Resolution {
    if remote_updated > local_at {
        Resolution::KeepRemote
    } else {
        Resolution::ApplyLocal
    }
}

/// Whether the remote copy changed after the entity was last synced.
pub fn remote_changed(remote_updated: DateTime<Utc>, last_synced_at: Option<DateTime<Utc>>) -> bool {
    last_synced_at.map_or(true, |baseline| remote_updated > baseline)
}
