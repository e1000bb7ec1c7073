use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Synchronization state of a local event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes not yet confirmed by the remote service.
    #[default]
    Pending,
    /// Draft that is intentionally never pushed.
    LocalOnly,
    Synced,
    /// Terminal push failure; needs the user's attention.
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::LocalOnly => "local_only",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "local_only" => Some(SyncStatus::LocalOnly),
            "synced" => Some(SyncStatus::Synced),
            "conflict" => Some(SyncStatus::Conflict),
            _ => None,
        }
    }
}

/// A calendar event as held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub local_id: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    pub calendar_id: String,
    #[serde(default)]
    pub sync_status: SyncStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Event {
    /// New pending event with empty optional content.
    pub fn new(
        local_id: impl Into<String>,
        calendar_id: impl Into<String>,
        title: impl Into<String>,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: None,
            title: title.into(),
            description: String::new(),
            start,
            end,
            all_day: false,
            location: String::new(),
            tag_ids: Vec::new(),
            calendar_id: calendar_id.into(),
            sync_status: SyncStatus::Pending,
            updated_at: Utc::now(),
            last_synced_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.local_id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "local_id".into(),
                message: "must not be empty".into(),
            });
        }
        if self.calendar_id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "calendar_id".into(),
                message: "must not be empty".into(),
            });
        }
        if self.end < self.start {
            return Err(ValidationError::InvalidTimeRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Whether user-visible content differs, ignoring sync bookkeeping.
    pub fn content_differs(&self, other: &Event) -> bool {
        self.title != other.title
            || self.description != other.description
            || self.start != other.start
            || self.end != other.end
            || self.all_day != other.all_day
            || self.location != other.location
            || self.tag_ids != other.tag_ids
            || self.calendar_id != other.calendar_id
    }

    /// Copy remote content onto this event, keeping local identity.
    pub fn apply_remote(&mut self, remote: &RemoteEvent, synced_at: DateTime<Utc>) {
        self.remote_id = Some(remote.remote_id.clone());
        self.title = remote.title.clone();
        self.description = remote.description.clone();
        self.start = remote.start;
        self.end = remote.end;
        self.all_day = remote.all_day;
        self.location = remote.location.clone();
        self.tag_ids = remote.tag_ids.clone();
        self.calendar_id = remote.calendar_id.clone();
        self.sync_status = SyncStatus::Synced;
        self.last_synced_at = Some(synced_at);
    }
}

/// An event as reported by the remote calendar service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub remote_id: String,
    pub calendar_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    /// Local id recorded when this client created the event, if any.
    #[serde(default)]
    pub local_id: Option<String>,
    /// Remote last-modified time.
    pub updated_at: DateTime<Utc>,
}

impl RemoteEvent {
    /// Build a local event from a remote-only entry.
    pub fn to_local(&self, local_id: String, synced_at: DateTime<Utc>) -> Event {
        Event {
            local_id,
            remote_id: Some(self.remote_id.clone()),
            title: self.title.clone(),
            description: self.description.clone(),
            start: self.start,
            end: self.end,
            all_day: self.all_day,
            location: self.location.clone(),
            tag_ids: self.tag_ids.clone(),
            calendar_id: self.calendar_id.clone(),
            sync_status: SyncStatus::Synced,
            updated_at: self.updated_at,
            last_synced_at: Some(synced_at),
        }
    }
}
