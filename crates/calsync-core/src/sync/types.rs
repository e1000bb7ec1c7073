//! Core types for calendar synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, ValidationError};
use crate::event::Event;

/// Kind of mutation recorded by a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ActionType::Create),
            "update" => Some(ActionType::Update),
            "delete" => Some(ActionType::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Syncable entity identifier. Events are the only kind today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    Event,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(EntityType::Event),
            _ => None,
        }
    }
}

/// One intended mutation awaiting propagation to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAction {
    /// `<unix-micros>-<random>`; sorts with `timestamp`.
    pub id: String,
    pub action_type: ActionType,
    pub entity_type: EntityType,
    /// The event's local id.
    pub entity_id: String,
    /// Creation time; ordering key and conflict baseline.
    pub timestamp: DateTime<Utc>,
    /// Full event snapshot at enqueue time.
    pub data: Option<Event>,
    pub synchronized: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Backoff gate; `None` means ready now.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncAction {
    pub fn new(
        action_type: ActionType,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: Option<Event>,
    ) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{:016}-{}", timestamp.timestamp_micros(), &suffix[..9]),
            action_type,
            entity_type,
            entity_id: entity_id.into(),
            timestamp,
            data,
            synchronized: false,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Ready to be attempted at `now` (backoff elapsed).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |t| t <= now)
    }
}

/// An action that exhausted its retries or was rejected outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub action: SyncAction,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What happened to one action during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Synchronized,
    /// Dropped in Merge because the remote side won the conflict.
    SupersededByRemote,
    Retrying { retry_count: u32, error: String },
    DeadLettered { error: String },
    /// Not attempted: backoff pending or an earlier action for the same
    /// entity did not confirm.
    Deferred,
}

/// Per-action record kept for a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub action_id: String,
    pub entity_id: String,
    pub action_type: ActionType,
    pub outcome: ActionOutcome,
}

/// One run of the orchestrator. Logged, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCycle {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_full_sync: bool,
    pub pending_actions_count: usize,
    pub records: Vec<PhaseRecord>,
}

impl SyncCycle {
    pub fn count(&self, pred: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Result of `force_sync`/a timer tick.
#[derive(Debug, Clone)]
pub enum CycleReport {
    Completed(SyncCycle),
    /// Another cycle was already in flight.
    Skipped,
}

impl CycleReport {
    pub fn cycle(&self) -> Option<&SyncCycle> {
        match self {
            CycleReport::Completed(c) => Some(c),
            CycleReport::Skipped => None,
        }
    }
}

/// Snapshot of the engine's externally visible state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub active: bool,
    pub in_progress: bool,
}

/// Remote service failures, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Authentication expired")]
    AuthExpired,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Remote entity not found: {0}")]
    NotFound(String),

    #[error("Rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Never worth retrying; dead-letter immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RemoteError::NotFound(_) | RemoteError::Rejected(_))
    }
}

/// Action Queue failures. Only storage can fail an append.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Storage(err.into())
    }
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}
