//! Durable action queue with coalescing.
//!
//! Every pending local mutation is written to SQLite before `record`/`append`
//! returns, so actions recorded while offline survive a restart. The in-memory
//! copy is the ordered view the orchestrator works from.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::event::Event;
use crate::storage::{open_connection, open_memory_connection};
use crate::sync::backoff::RetryPolicy;
use crate::sync::types::{ActionType, DeadLetter, EntityType, QueueError, SyncAction};

/// What `record` did with a new mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// A new action was appended.
    Appended(SyncAction),
    /// An existing queued create/update took the new snapshot in place.
    Coalesced(SyncAction),
    /// Delete of an entity that never reached the remote; nothing to push.
    /// `superseded` counts the queued actions it removed.
    Discarded { superseded: usize },
    /// Local-only draft; written to the store and never queued.
    KeptLocal,
}

/// Result of a failed push attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered(DeadLetter),
}

struct QueueInner {
    conn: Connection,
    /// Ordered by (timestamp, id).
    actions: Vec<SyncAction>,
    in_flight: HashSet<String>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// The Action Queue. Its lock is independent of the cycle lock and is never
/// held across a remote call.
pub struct ActionQueue {
    inner: Mutex<QueueInner>,
}

impl ActionQueue {
    /// Open the queue at `path`, loading any actions left from a previous run.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or a row is corrupt.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Self::from_connection(open_connection(path)?)
    }

    /// Open a private in-memory queue.
    pub fn open_memory() -> Result<Self, QueueError> {
        Self::from_connection(open_memory_connection()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        let actions = load_actions(&conn)?;
        let last_timestamp = actions.iter().map(|a| a.timestamp).max();
        debug!(count = actions.len(), "loaded action queue");
        Ok(Self {
            inner: Mutex::new(QueueInner {
                conn,
                actions,
                in_flight: HashSet::new(),
                last_timestamp,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Storage(DatabaseError::Locked))
    }

    /// Strictly increasing timestamp for a new action.
    pub fn next_timestamp(&self) -> Result<DateTime<Utc>, QueueError> {
        let mut inner = self.lock()?;
        Ok(inner.next_timestamp())
    }

    /// Persist `action` as-is and add it to the ordered view.
    ///
    /// # Errors
    /// Fails only when the write cannot be made durable.
    pub fn append(&self, action: SyncAction) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner.insert(action)
    }

    /// Coalesce then append a mutation for `entity_id`.
    ///
    /// `remote_known` tells whether the entity already has a remote copy.
    pub fn record(
        &self,
        action_type: ActionType,
        entity_type: EntityType,
        entity_id: &str,
        data: Option<Event>,
        remote_known: bool,
    ) -> Result<RecordOutcome, QueueError> {
        let mut inner = self.lock()?;
        let timestamp = inner.next_timestamp();

        match action_type {
            ActionType::Create => {
                let action = SyncAction::new(action_type, entity_type, entity_id, timestamp, data);
                inner.insert(action.clone())?;
                Ok(RecordOutcome::Appended(action))
            }
            ActionType::Update => {
                if let Some(idx) = inner.coalesce_target(entity_id) {
                    let mut merged = inner.actions[idx].clone();
                    merged.data = data;
                    inner.persist(&merged)?;
                    inner.actions[idx] = merged.clone();
                    debug!(entity_id, action_id = %merged.id, "coalesced update into queued action");
                    return Ok(RecordOutcome::Coalesced(merged));
                }
                let action = SyncAction::new(action_type, entity_type, entity_id, timestamp, data);
                inner.insert(action.clone())?;
                Ok(RecordOutcome::Appended(action))
            }
            ActionType::Delete => {
                let superseded = inner.remove_queued_writes(entity_id)?;
                let reached_remote = remote_known || inner.touched_remote(entity_id);
                if !reached_remote {
                    debug!(entity_id, superseded, "discarded delete of never-synced entity");
                    return Ok(RecordOutcome::Discarded { superseded });
                }
                let action = SyncAction::new(action_type, entity_type, entity_id, timestamp, data);
                inner.insert(action.clone())?;
                Ok(RecordOutcome::Appended(action))
            }
        }
    }

    /// Unsynchronized actions ordered by timestamp ascending.
    pub fn pending(&self) -> Result<Vec<SyncAction>, QueueError> {
        let inner = self.lock()?;
        Ok(inner
            .actions
            .iter()
            .filter(|a| !a.synchronized)
            .cloned()
            .collect())
    }

    /// Every queued action, synchronized or not.
    pub fn snapshot(&self) -> Result<Vec<SyncAction>, QueueError> {
        Ok(self.lock()?.actions.clone())
    }

    /// Number of unsynchronized actions.
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.actions.iter().filter(|a| !a.synchronized).count())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, action_id: &str) -> Result<Option<SyncAction>, QueueError> {
        Ok(self
            .lock()?
            .actions
            .iter()
            .find(|a| a.id == action_id)
            .cloned())
    }

    /// Whether any unsynchronized action other than `except` targets `entity_id`.
    pub fn has_pending_for(&self, entity_id: &str, except: &str) -> Result<bool, QueueError> {
        Ok(self
            .lock()?
            .actions
            .iter()
            .any(|a| !a.synchronized && a.entity_id == entity_id && a.id != except))
    }

    /// Mark an action as being pushed. Returns false if it is gone or done.
    pub fn begin_flight(&self, action_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.lock()?;
        let live = inner
            .actions
            .iter()
            .any(|a| a.id == action_id && !a.synchronized);
        if live {
            inner.in_flight.insert(action_id.to_string());
        }
        Ok(live)
    }

    /// Release an in-flight mark without recording an outcome.
    pub fn end_flight(&self, action_id: &str) -> Result<(), QueueError> {
        self.lock()?.in_flight.remove(action_id);
        Ok(())
    }

    pub fn is_in_flight(&self, action_id: &str) -> Result<bool, QueueError> {
        Ok(self.lock()?.in_flight.contains(action_id))
    }

    pub fn mark_synchronized(&self, action_id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner.in_flight.remove(action_id);
        let idx = inner.index_of(action_id)?;
        let mut action = inner.actions[idx].clone();
        action.synchronized = true;
        action.last_error = None;
        inner.persist(&action)?;
        inner.actions[idx] = action;
        Ok(())
    }

    /// Count a failed attempt; dead-letters once the policy is exhausted.
    pub fn mark_failed(
        &self,
        action_id: &str,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, QueueError> {
        let mut inner = self.lock()?;
        inner.in_flight.remove(action_id);
        let idx = inner.index_of(action_id)?;
        let mut action = inner.actions[idx].clone();
        action.retry_count += 1;
        action.last_error = Some(error.to_string());

        if policy.exhausted(action.retry_count) {
            warn!(action_id, entity_id = %action.entity_id, retry_count = action.retry_count, "retries exhausted, dead-lettering");
            let letter = inner.move_to_dead_letters(idx, action, error, now)?;
            return Ok(FailureDisposition::DeadLettered(letter));
        }

        let delay = policy.delay_for(action.retry_count);
        let next_attempt_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        action.next_attempt_at = Some(next_attempt_at);
        let retry_count = action.retry_count;
        inner.persist(&action)?;
        inner.actions[idx] = action;
        Ok(FailureDisposition::Retrying {
            retry_count,
            next_attempt_at,
        })
    }

    /// Move an action straight to the dead-letter set (permanent rejection).
    pub fn dead_letter(
        &self,
        action_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetter, QueueError> {
        let mut inner = self.lock()?;
        inner.in_flight.remove(action_id);
        let idx = inner.index_of(action_id)?;
        let mut action = inner.actions[idx].clone();
        action.last_error = Some(error.to_string());
        inner.move_to_dead_letters(idx, action, error, now)
    }

    /// Drop synchronized actions once their cycle has committed.
    pub fn purge_synchronized(&self) -> Result<usize, QueueError> {
        let mut inner = self.lock()?;
        let done: Vec<String> = inner
            .actions
            .iter()
            .filter(|a| a.synchronized)
            .map(|a| a.id.clone())
            .collect();
        if done.is_empty() {
            return Ok(0);
        }
        let tx = inner.conn.unchecked_transaction()?;
        for id in &done {
            tx.execute("DELETE FROM sync_actions WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        inner.actions.retain(|a| !a.synchronized);
        Ok(done.len())
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT body FROM dead_letters ORDER BY dead_lettered_at, action_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut letters = Vec::new();
        for body in rows {
            letters.push(serde_json::from_str(&body?)?);
        }
        Ok(letters)
    }

    pub fn dead_letter_count(&self) -> Result<usize, QueueError> {
        let inner = self.lock()?;
        let n: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl QueueInner {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn insert(&mut self, action: SyncAction) -> Result<(), QueueError> {
        let body = serde_json::to_string(&action)?;
        self.conn.execute(
            "INSERT INTO sync_actions (id, entity_id, timestamp, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                action.id,
                action.entity_id,
                action.timestamp.to_rfc3339(),
                body
            ],
        )?;
        if self.last_timestamp.map_or(true, |t| action.timestamp > t) {
            self.last_timestamp = Some(action.timestamp);
        }
        let pos = self
            .actions
            .partition_point(|a| (a.timestamp, &a.id) <= (action.timestamp, &action.id));
        self.actions.insert(pos, action);
        Ok(())
    }

    fn persist(&self, action: &SyncAction) -> Result<(), QueueError> {
        let body = serde_json::to_string(action)?;
        let n = self.conn.execute(
            "UPDATE sync_actions SET body = ?2 WHERE id = ?1",
            params![action.id, body],
        )?;
        if n == 0 {
            return Err(QueueError::UnknownAction(action.id.clone()));
        }
        Ok(())
    }

    fn index_of(&self, action_id: &str) -> Result<usize, QueueError> {
        self.actions
            .iter()
            .position(|a| a.id == action_id)
            .ok_or_else(|| QueueError::UnknownAction(action_id.to_string()))
    }

    /// Latest unsynchronized action for the entity, if it is a queued
    /// (not in-flight) create/update.
    fn coalesce_target(&self, entity_id: &str) -> Option<usize> {
        let idx = self
            .actions
            .iter()
            .rposition(|a| a.entity_id == entity_id && !a.synchronized)?;
        let candidate = &self.actions[idx];
        let writable = matches!(candidate.action_type, ActionType::Create | ActionType::Update);
        (writable && !self.in_flight.contains(&candidate.id)).then_some(idx)
    }

    /// Remove queued (not in-flight) create/update actions for the entity.
    fn remove_queued_writes(&mut self, entity_id: &str) -> Result<usize, QueueError> {
        let doomed: Vec<String> = self
            .actions
            .iter()
            .filter(|a| {
                a.entity_id == entity_id
                    && !a.synchronized
                    && matches!(a.action_type, ActionType::Create | ActionType::Update)
                    && !self.in_flight.contains(&a.id)
            })
            .map(|a| a.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        for id in &doomed {
            tx.execute("DELETE FROM sync_actions WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        self.actions.retain(|a| !doomed.contains(&a.id));
        Ok(doomed.len())
    }

    /// An action for this entity is in flight or already confirmed.
    fn touched_remote(&self, entity_id: &str) -> bool {
        self.actions
            .iter()
            .any(|a| a.entity_id == entity_id && (a.synchronized || self.in_flight.contains(&a.id)))
    }

    fn move_to_dead_letters(
        &mut self,
        idx: usize,
        action: SyncAction,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetter, QueueError> {
        let letter = DeadLetter {
            action,
            error: error.to_string(),
            dead_lettered_at: now,
        };
        let body = serde_json::to_string(&letter)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM sync_actions WHERE id = ?1",
            params![letter.action.id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO dead_letters (action_id, entity_id, error, dead_lettered_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                letter.action.id,
                letter.action.entity_id,
                letter.error,
                now.to_rfc3339(),
                body
            ],
        )?;
        tx.commit()?;
        self.actions.remove(idx);
        Ok(letter)
    }
}

fn load_actions(conn: &Connection) -> Result<Vec<SyncAction>, QueueError> {
    let mut stmt = conn.prepare("SELECT body FROM sync_actions")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut actions = Vec::new();
    for body in rows {
        let action: SyncAction = serde_json::from_str(&body?)?;
        actions.push(action);
    }
    actions.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    Ok(actions)
}
