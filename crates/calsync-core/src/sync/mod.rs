//! Calendar synchronization layer.
//!
//! Local mutations are recorded as actions in a durable queue and
//! reconciled with the remote calendar by a four-phase cycle
//! (pull, merge, commit, push).

pub mod action_queue;
pub mod backoff;
pub mod calendar_client;
pub mod conflict_resolver;
pub mod event_codec;
pub mod notify;
pub mod remote;
pub mod sync_engine;
pub mod types;

#[cfg(test)]
mod action_queue_tests;

pub use action_queue::{ActionQueue, FailureDisposition, RecordOutcome};
pub use backoff::RetryPolicy;
pub use calendar_client::GoogleCalendar;
pub use conflict_resolver::{resolve, Resolution};
pub use notify::{EntityChange, Notifier, SyncNotification};
pub use remote::{EventPage, RemoteAdapter, RemoteCalendar, StaticToken, TimeRange, TokenProvider};
pub use sync_engine::SyncEngine;
pub use types::{
    ActionOutcome, ActionType, CycleReport, DeadLetter, EntityType, PhaseRecord, QueueError,
    RemoteError, SyncAction, SyncCycle, SyncError, SyncState,
};
