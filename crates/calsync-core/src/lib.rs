//! # calsync Core Library
//!
//! Offline-tolerant synchronization of calendar events between a local
//! SQLite store and a remote calendar service.
//!
//! ## Architecture
//!
//! - **Event Store**: authoritative local copy of every event
//! - **Action Queue**: durable, coalescing log of local mutations
//! - **Sync Engine**: timer-driven pull / merge / commit / push cycle with
//!   local-preferred last-write-wins conflict resolution
//! - **Remote Adapter**: timeout and auth-refresh wrapper over a
//!   [`RemoteCalendar`], with a Google Calendar implementation
//!
//! ## Key Components
//!
//! - [`SyncEngine`]: the orchestrator and its command surface
//! - [`EventStore`]: event persistence
//! - [`ActionQueue`]: pending local actions and dead letters
//! - [`SyncConfig`]: TOML configuration

pub mod error;
pub mod event;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, DatabaseError, ValidationError};
pub use event::{Event, RemoteEvent, SyncStatus};
pub use storage::{EventStore, SyncConfig, WindowConfig};
pub use sync::{
    ActionQueue, ActionType, CycleReport, EntityType, GoogleCalendar, RecordOutcome,
    RemoteAdapter, RemoteCalendar, RemoteError, SyncAction, SyncEngine, SyncError,
    SyncNotification, TimeRange,
};
