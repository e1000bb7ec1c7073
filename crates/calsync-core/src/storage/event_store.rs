//! Local Event Store.
//!
//! Authoritative local copy of every event keyed by local id. Each row keeps
//! the full event as JSON next to the columns used for lookups.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::database::{open_connection, open_memory_connection};
use crate::error::DatabaseError;
use crate::event::{Event, SyncStatus};

const LAST_SYNC_KEY: &str = "last_sync_at";

/// A single write produced by the Commit phase.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Upsert(Event),
    Remove(String),
}

/// SQLite-backed event store.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open the store at `path`, creating the schema if needed.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }

    /// Open a private in-memory store.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        Ok(Self {
            conn: Mutex::new(open_memory_connection()?),
        })
    }

    pub fn get(&self, local_id: &str) -> Result<Option<Event>, DatabaseError> {
        let conn = self.conn.lock()?;
        load(&conn, local_id)
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<Event>, DatabaseError> {
        let conn = self.conn.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM events WHERE remote_id = ?1",
                params![remote_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| decode(&b)).transpose()
    }

    /// All events in insertion order.
    pub fn list(&self) -> Result<Vec<Event>, DatabaseError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM events ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for body in rows {
            events.push(decode(&body?)?);
        }
        Ok(events)
    }

    pub fn len(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.len()? == 0)
    }

    /// First insertion of a brand-new event.
    ///
    /// # Errors
    /// Fails if an event with the same local id already exists.
    pub fn insert_new(&self, event: &Event) -> Result<(), DatabaseError> {
        let conn = self.conn.lock()?;
        let body = encode(event)?;
        conn.execute(
            "INSERT INTO events (local_id, remote_id, calendar_id, sync_status, updated_at, last_synced_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.local_id,
                event.remote_id,
                event.calendar_id,
                event.sync_status.as_str(),
                event.updated_at.to_rfc3339(),
                event.last_synced_at.map(|t| t.to_rfc3339()),
                body,
            ],
        )?;
        Ok(())
    }

    pub fn upsert(&self, event: &Event) -> Result<(), DatabaseError> {
        let conn = self.conn.lock()?;
        write(&conn, event)
    }

    /// Returns whether a row was removed.
    pub fn remove(&self, local_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock()?;
        let n = conn.execute("DELETE FROM events WHERE local_id = ?1", params![local_id])?;
        Ok(n > 0)
    }

    /// Record the remote id assigned by a confirmed create.
    pub fn set_remote_id(
        &self,
        local_id: &str,
        remote_id: &str,
        synced_at: DateTime<Utc>,
        still_pending: bool,
    ) -> Result<Option<Event>, DatabaseError> {
        self.update_with(local_id, |event| {
            event.remote_id = Some(remote_id.to_string());
            event.last_synced_at = Some(synced_at);
            if !still_pending && event.sync_status != SyncStatus::LocalOnly {
                event.sync_status = SyncStatus::Synced;
            }
        })
    }

    pub fn set_status(
        &self,
        local_id: &str,
        status: SyncStatus,
    ) -> Result<Option<Event>, DatabaseError> {
        self.update_with(local_id, |event| event.sync_status = status)
    }

    /// Apply every change in one transaction; all or nothing.
    pub fn commit(&self, changes: &[StoreChange]) -> Result<(), DatabaseError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        for change in changes {
            match change {
                StoreChange::Upsert(event) => write(&tx, event)?,
                StoreChange::Remove(local_id) => {
                    tx.execute("DELETE FROM events WHERE local_id = ?1", params![local_id])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let Some(raw) = self.kv_get(LAST_SYNC_KEY)? else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&raw).map_err(|e| DatabaseError::CorruptRow {
            table: "kv",
            message: e.to_string(),
        })?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.kv_set(LAST_SYNC_KEY, &at.to_rfc3339())
    }

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn update_with(
        &self,
        local_id: &str,
        f: impl FnOnce(&mut Event),
    ) -> Result<Option<Event>, DatabaseError> {
        let conn = self.conn.lock()?;
        let Some(mut event) = load(&conn, local_id)? else {
            return Ok(None);
        };
        f(&mut event);
        write(&conn, &event)?;
        Ok(Some(event))
    }
}

fn load(conn: &Connection, local_id: &str) -> Result<Option<Event>, DatabaseError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM events WHERE local_id = ?1",
            params![local_id],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| decode(&b)).transpose()
}

fn write(conn: &Connection, event: &Event) -> Result<(), DatabaseError> {
    let body = encode(event)?;
    conn.execute(
        "INSERT INTO events (local_id, remote_id, calendar_id, sync_status, updated_at, last_synced_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(local_id) DO UPDATE SET
            remote_id = excluded.remote_id,
            calendar_id = excluded.calendar_id,
            sync_status = excluded.sync_status,
            updated_at = excluded.updated_at,
            last_synced_at = excluded.last_synced_at,
            body = excluded.body",
        params![
            event.local_id,
            event.remote_id,
            event.calendar_id,
            event.sync_status.as_str(),
            event.updated_at.to_rfc3339(),
            event.last_synced_at.map(|t| t.to_rfc3339()),
            body,
        ],
    )?;
    Ok(())
}

fn encode(event: &Event) -> Result<String, DatabaseError> {
    serde_json::to_string(event).map_err(|e| DatabaseError::CorruptRow {
        table: "events",
        message: e.to_string(),
    })
}

fn decode(body: &str) -> Result<Event, DatabaseError> {
    serde_json::from_str(body).map_err(|e| DatabaseError::CorruptRow {
        table: "events",
        message: e.to_string(),
    })
}
