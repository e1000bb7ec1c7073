//! Sync Cycle Orchestrator.
//!
//! A cycle runs four phases in order:
//! - Pull: fetch the remote snapshot into a cache keyed by remote id
//! - Merge: apply pending local actions to the cache, resolving conflicts
//! - Commit: write the merged result to the event store in one transaction
//! - Push: send surviving actions to the remote, one entity at a time,
//!   independent entities concurrently
//!
//! At most one cycle runs at a time. Local actions may be recorded while a
//! cycle is running; they are picked up by the next one.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::event::{Event, RemoteEvent, SyncStatus};
use crate::storage::{EventStore, StoreChange, SyncConfig};
use crate::sync::action_queue::{ActionQueue, FailureDisposition, RecordOutcome};
use crate::sync::backoff::RetryPolicy;
use crate::sync::conflict_resolver::{remote_changed, resolve, Resolution};
use crate::sync::notify::{EntityChange, Notifier, SyncNotification};
use crate::sync::remote::{RemoteAdapter, TimeRange};
use crate::sync::types::{
    ActionOutcome, ActionType, CycleReport, DeadLetter, EntityType, PhaseRecord, RemoteError,
    SyncAction, SyncCycle, SyncError, SyncState,
};

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<EventStore>,
    queue: Arc<ActionQueue>,
    remote: RemoteAdapter,
    config: SyncConfig,
    policy: RetryPolicy,
    notifier: Notifier,
    cycle_in_flight: AtomicBool,
    timer_active: AtomicBool,
    timer_generation: AtomicU64,
    needs_full_sync: AtomicBool,
}

/// Actions for one entity, pushed strictly in order.
struct PushGroup {
    entity_id: String,
    remote_id: Option<String>,
    actions: Vec<SyncAction>,
}

#[derive(Default)]
struct MergeOutput {
    changes: Vec<StoreChange>,
    notices: Vec<(String, EntityChange)>,
    records: Vec<PhaseRecord>,
    groups: Vec<PushGroup>,
    /// Actions the remote side won; held in flight until the commit lands.
    superseded: Vec<String>,
}

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Clears `cycle_in_flight` when the cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    /// Build an engine over an existing store and queue.
    ///
    /// The first cycle is a full sync when the store has never completed one.
    pub fn new(
        store: Arc<EventStore>,
        queue: Arc<ActionQueue>,
        remote: RemoteAdapter,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let first_run = store.last_sync_at()?.is_none();
        let policy = RetryPolicy::from_config(&config);
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                queue,
                remote,
                config,
                policy,
                notifier: Notifier::new(),
                cycle_in_flight: AtomicBool::new(false),
                timer_active: AtomicBool::new(false),
                timer_generation: AtomicU64::new(0),
                needs_full_sync: AtomicBool::new(first_run),
            }),
        })
    }

    /// Open store and queue on the database at `path`.
    pub fn open(path: &Path, remote: RemoteAdapter, config: SyncConfig) -> Result<Self, SyncError> {
        let store = Arc::new(EventStore::open(path)?);
        let queue = Arc::new(ActionQueue::open(path)?);
        Self::new(store, queue, remote, config)
    }

    /// Open against private in-memory databases.
    pub fn open_memory(remote: RemoteAdapter, config: SyncConfig) -> Result<Self, SyncError> {
        let store = Arc::new(EventStore::open_memory()?);
        let queue = Arc::new(ActionQueue::open_memory()?);
        Self::new(store, queue, remote, config)
    }

    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Record a local mutation. Returns once the action is durable.
    ///
    /// A create inserts the event into the store immediately. Updates and
    /// deletes reach the store at the next commit, except that deleting an
    /// event the remote never saw purges it at once.
    ///
    /// # Errors
    /// Validation errors for missing or mismatched snapshots; storage errors
    /// when the action cannot be persisted.
    pub fn record_local_action(
        &self,
        action_type: ActionType,
        entity_type: EntityType,
        entity_id: &str,
        data: Option<Event>,
    ) -> Result<RecordOutcome, SyncError> {
        let inner = &self.inner;
        match action_type {
            ActionType::Create => {
                let mut event = require_snapshot(action_type, entity_id, data)?;
                event.remote_id = None;
                event.last_synced_at = None;
                if event.sync_status == SyncStatus::LocalOnly {
                    inner.store.insert_new(&event)?;
                    debug!(entity_id, "stored local-only draft");
                    return Ok(RecordOutcome::KeptLocal);
                }
                event.sync_status = SyncStatus::Pending;
                inner.store.insert_new(&event)?;
                match inner
                    .queue
                    .record(action_type, entity_type, entity_id, Some(event), false)
                {
                    Ok(outcome) => {
                        info!(entity_id, "recorded local create");
                        Ok(outcome)
                    }
                    Err(err) => {
                        // Keep store and queue consistent: no row without its action.
                        if let Err(cleanup) = inner.store.remove(entity_id) {
                            warn!(entity_id, error = %cleanup, "could not roll back inserted event");
                        }
                        Err(err.into())
                    }
                }
            }
            ActionType::Update => {
                let mut event = require_snapshot(action_type, entity_id, data)?;
                let current = inner
                    .store
                    .get(entity_id)?
                    .ok_or_else(|| unknown_entity(entity_id))?;
                self.ensure_not_deleting(entity_id)?;
                event.remote_id = current.remote_id.clone();
                event.last_synced_at = current.last_synced_at;
                let remote_known = current.remote_id.is_some();
                if event.sync_status == SyncStatus::LocalOnly && !remote_known {
                    inner.store.upsert(&event)?;
                    debug!(entity_id, "updated local-only draft");
                    return Ok(RecordOutcome::KeptLocal);
                }
                event.sync_status = SyncStatus::Pending;

                // Nothing remote and nothing queued: a published draft or a
                // create that was dead-lettered. Push it as a create.
                let publish = !remote_known && !inner.queue.has_pending_for(entity_id, "")?;
                let effective = if publish { ActionType::Create } else { action_type };
                let outcome =
                    inner
                        .queue
                        .record(effective, entity_type, entity_id, Some(event), remote_known)?;
                info!(entity_id, action = %effective, "recorded local update");
                Ok(outcome)
            }
            ActionType::Delete => {
                let current = inner
                    .store
                    .get(entity_id)?
                    .ok_or_else(|| unknown_entity(entity_id))?;
                self.ensure_not_deleting(entity_id)?;
                let remote_known = current.remote_id.is_some();
                let snapshot = data.or(Some(current));
                let outcome =
                    inner
                        .queue
                        .record(action_type, entity_type, entity_id, snapshot, remote_known)?;

                if let RecordOutcome::Discarded { .. } = outcome {
                    // A create may have been confirmed between the lookup and the record.
                    let latest = inner.store.get(entity_id)?;
                    if latest.as_ref().is_some_and(|e| e.remote_id.is_some()) {
                        let timestamp = inner.queue.next_timestamp()?;
                        let action =
                            SyncAction::new(action_type, entity_type, entity_id, timestamp, latest);
                        inner.queue.append(action.clone())?;
                        info!(entity_id, "recorded local delete");
                        return Ok(RecordOutcome::Appended(action));
                    }
                    inner.store.remove(entity_id)?;
                    inner.notifier.entity(entity_id, EntityChange::Removed);
                    info!(entity_id, "purged never-synced event");
                    return Ok(outcome);
                }
                info!(entity_id, "recorded local delete");
                Ok(outcome)
            }
        }
    }

    /// Run one cycle now. Returns [`CycleReport::Skipped`] if one is already running.
    ///
    /// # Errors
    /// A pull or storage failure aborts the cycle; nothing is committed.
    pub async fn force_sync(&self) -> Result<CycleReport, SyncError> {
        self.inner.run_guarded().await
    }

    /// Enable the periodic timer. Must be called inside a Tokio runtime.
    ///
    /// The first tick fires immediately.
    pub fn start(&self) {
        if self.inner.timer_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        info!(interval_secs = inner.config.interval().as_secs(), "sync timer started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !inner.timer_active.load(Ordering::SeqCst)
                    || inner.timer_generation.load(Ordering::SeqCst) != generation
                {
                    break;
                }
                if let Err(err) = inner.run_guarded().await {
                    warn!(error = %err, "timer cycle failed");
                }
            }
            debug!(generation, "sync timer exited");
        });
    }

    /// Disable the timer. A cycle already running finishes normally.
    pub fn stop(&self) {
        if self.inner.timer_active.swap(false, Ordering::SeqCst) {
            info!("sync timer stopped");
        }
    }

    /// Disable the timer and wait for a running cycle to finish.
    pub async fn shutdown(&self) {
        self.stop();
        while self.is_syncing() {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        debug!("sync engine idle");
    }

    /// Whether the timer is enabled (not whether a cycle is running).
    pub fn is_active(&self) -> bool {
        self.inner.timer_active.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.cycle_in_flight.load(Ordering::SeqCst)
    }

    /// Completion time of the last successful cycle.
    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.inner.store.last_sync_at()?)
    }

    /// Make the next cycle pull the full window. Starts it right away when
    /// the timer is running and no cycle is in flight.
    pub fn trigger_full_sync(&self) {
        self.inner.needs_full_sync.store(true, Ordering::SeqCst);
        info!("full sync requested");
        if !self.is_active() || self.is_syncing() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                if let Err(err) = inner.run_guarded().await {
                    warn!(error = %err, "full sync failed");
                }
            });
        }
    }

    pub fn needs_full_sync(&self) -> bool {
        self.inner.needs_full_sync.load(Ordering::SeqCst)
    }

    pub fn pending_actions_count(&self) -> Result<usize, SyncError> {
        Ok(self.inner.queue.len()?)
    }

    pub fn dead_letter_count(&self) -> Result<usize, SyncError> {
        Ok(self.inner.queue.dead_letter_count()?)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, SyncError> {
        Ok(self.inner.queue.dead_letters()?)
    }

    pub fn queue_snapshot(&self) -> Result<Vec<SyncAction>, SyncError> {
        Ok(self.inner.queue.snapshot()?)
    }

    pub fn state(&self) -> Result<SyncState, SyncError> {
        Ok(SyncState {
            last_sync_at: self.last_sync_time()?,
            pending_count: self.pending_actions_count()?,
            dead_letter_count: self.dead_letter_count()?,
            active: self.is_active(),
            in_progress: self.is_syncing(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.inner.notifier.subscribe()
    }

    /// A queued delete freezes the event until the remote confirms it.
    fn ensure_not_deleting(&self, entity_id: &str) -> Result<(), SyncError> {
        let deleting = self
            .inner
            .queue
            .pending()?
            .iter()
            .any(|a| a.entity_id == entity_id && a.action_type == ActionType::Delete);
        if deleting {
            return Err(ValidationError::InvalidValue {
                field: "entity_id".into(),
                message: format!("'{entity_id}' has a pending delete"),
            }
            .into());
        }
        Ok(())
    }
}

impl EngineInner {
    async fn run_guarded(&self) -> Result<CycleReport, SyncError> {
        if self
            .cycle_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("cycle already in flight, skipping");
            return Ok(CycleReport::Skipped);
        }
        let _guard = CycleGuard(&self.cycle_in_flight);

        match self.run_cycle().await {
            Ok(cycle) => Ok(CycleReport::Completed(cycle)),
            Err(err) => {
                warn!(error = %err, "sync cycle aborted");
                self.notifier.send(SyncNotification::CycleAborted {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncCycle, SyncError> {
        let started_at = Utc::now();
        let is_full_sync = self.needs_full_sync.load(Ordering::SeqCst);
        let pending = self.queue.pending()?;
        info!(is_full_sync, pending = pending.len(), "sync cycle started");
        self.notifier.send(SyncNotification::CycleStarted {
            is_full_sync,
            queue_len: pending.len(),
        });

        // Pull
        let range = self.pull_range(is_full_sync, started_at);
        let mut remote_cache: HashMap<String, RemoteEvent> = HashMap::new();
        for calendar_id in &self.config.calendar_ids {
            for event in self.remote.fetch_all(calendar_id, range.as_ref()).await? {
                remote_cache.insert(event.remote_id.clone(), event);
            }
        }

        // Merge
        let merged = self.merge(&pending, &remote_cache, range.as_ref())?;

        // Commit
        if let Err(err) = self.store.commit(&merged.changes) {
            self.release(&merged.superseded);
            return Err(err.into());
        }
        for action_id in &merged.superseded {
            self.queue.mark_synchronized(action_id)?;
        }
        for (local_id, change) in &merged.notices {
            self.notifier.entity(local_id, *change);
        }
        debug!(changes = merged.changes.len(), "committed merged snapshot");

        // Push
        let mut records = merged.records;
        records.extend(self.push(merged.groups).await?);

        self.queue.purge_synchronized()?;
        let finished_at = Utc::now();
        self.store.set_last_sync_at(finished_at)?;
        if is_full_sync {
            self.needs_full_sync.store(false, Ordering::SeqCst);
        }

        let queue_len = self.queue.len()?;
        let cycle = SyncCycle {
            started_at,
            finished_at: Some(finished_at),
            is_full_sync,
            pending_actions_count: pending.len(),
            records,
        };
        info!(
            is_full_sync,
            synchronized = cycle.count(|o| matches!(o, ActionOutcome::Synchronized)),
            retrying = cycle.count(|o| matches!(o, ActionOutcome::Retrying { .. })),
            dead_lettered = cycle.count(|o| matches!(o, ActionOutcome::DeadLettered { .. })),
            queue_len,
            "sync cycle completed"
        );
        self.notifier.send(SyncNotification::CycleCompleted {
            completed_at: finished_at,
            queue_len,
        });
        Ok(cycle)
    }

    fn pull_range(&self, is_full_sync: bool, now: DateTime<Utc>) -> Option<TimeRange> {
        if is_full_sync {
            self.config.full_sync_window.map(|w| w.range_around(now))
        } else {
            Some(self.config.incremental_window.range_around(now))
        }
    }

    fn merge(
        &self,
        pending: &[SyncAction],
        remote_cache: &HashMap<String, RemoteEvent>,
        range: Option<&TimeRange>,
    ) -> Result<MergeOutput, SyncError> {
        let mut out = MergeOutput::default();
        if let Err(err) = self.merge_into(pending, remote_cache, range, &mut out) {
            self.release(&out.superseded);
            return Err(err);
        }
        Ok(out)
    }

    fn merge_into(
        &self,
        pending: &[SyncAction],
        remote_cache: &HashMap<String, RemoteEvent>,
        range: Option<&TimeRange>,
        out: &mut MergeOutput,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let locals: HashMap<String, Event> = self
            .store
            .list()?
            .into_iter()
            .map(|e| (e.local_id.clone(), e))
            .collect();

        // Local-ahead entries: entity id -> merged snapshot, `None` for delete.
        let mut ahead: Vec<(String, Option<Event>)> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for action in pending {
            let entity_id = action.entity_id.as_str();
            let local = locals.get(entity_id);
            let remote_id = local
                .and_then(|e| e.remote_id.clone())
                .or_else(|| action.data.as_ref().and_then(|d| d.remote_id.clone()));
            let last_synced = local.and_then(|e| e.last_synced_at);

            let resolution = match (action.action_type, remote_id.as_ref().and_then(|r| remote_cache.get(r))) {
                (ActionType::Update | ActionType::Delete, Some(remote))
                    if remote_changed(remote.updated_at, last_synced) =>
                {
                    resolve(action.action_type, action.timestamp, remote.updated_at, last_synced)
                }
                _ => Resolution::ApplyLocal,
            };

            if resolution == Resolution::KeepRemote {
                warn!(
                    entity_id,
                    action_id = %action.id,
                    action = %action.action_type,
                    "remote edit wins, dropping local action"
                );
                // Marked synchronized only after the commit; the flight mark
                // keeps new edits from coalescing into it meanwhile.
                if self.queue.begin_flight(&action.id)? {
                    out.superseded.push(action.id.clone());
                }
                out.records.push(phase_record(action, ActionOutcome::SupersededByRemote));
                continue;
            }

            let snapshot = match action.action_type {
                ActionType::Create | ActionType::Update => action.data.clone().map(|mut event| {
                    if let Some(local) = local {
                        event.remote_id = local.remote_id.clone();
                        event.last_synced_at = local.last_synced_at;
                    }
                    if event.sync_status != SyncStatus::LocalOnly {
                        event.sync_status = SyncStatus::Pending;
                    }
                    event
                }),
                ActionType::Delete => None,
            };
            match ahead.iter_mut().find(|(id, _)| id == entity_id) {
                Some(entry) => entry.1 = snapshot,
                None => ahead.push((entity_id.to_string(), snapshot)),
            }

            match group_index.get(entity_id) {
                Some(&idx) => out.groups[idx].actions.push(action.clone()),
                None => {
                    group_index.insert(entity_id.to_string(), out.groups.len());
                    out.groups.push(PushGroup {
                        entity_id: entity_id.to_string(),
                        remote_id,
                        actions: vec![action.clone()],
                    });
                }
            }
        }

        for (local_id, snapshot) in ahead {
            match snapshot {
                Some(event) => out.changes.push(StoreChange::Upsert(event)),
                // A deleted row stays until the remote confirms the delete.
                None => {
                    if let Some(local) = locals.get(&local_id) {
                        if local.sync_status != SyncStatus::Pending {
                            let mut event = local.clone();
                            event.sync_status = SyncStatus::Pending;
                            out.changes.push(StoreChange::Upsert(event));
                        }
                    }
                }
            }
        }

        // Anything still queued, including actions recorded since the cycle began.
        let mut local_ahead: HashSet<String> = group_index.into_keys().collect();
        local_ahead.extend(
            self.queue
                .pending()?
                .into_iter()
                .filter(|a| !out.superseded.contains(&a.id))
                .map(|a| a.entity_id),
        );

        self.propagate_remote(&locals, remote_cache, &local_ahead, now, out);
        self.remove_vanished(&locals, remote_cache, &local_ahead, range, out);
        Ok(())
    }

    /// Bring remote-only and remotely edited events into the store.
    fn propagate_remote(
        &self,
        locals: &HashMap<String, Event>,
        remote_cache: &HashMap<String, RemoteEvent>,
        local_ahead: &HashSet<String>,
        now: DateTime<Utc>,
        out: &mut MergeOutput,
    ) {
        let by_remote: HashMap<&str, &str> = locals
            .values()
            .filter_map(|e| e.remote_id.as_deref().map(|r| (r, e.local_id.as_str())))
            .collect();

        let mut remotes: Vec<&RemoteEvent> = remote_cache.values().collect();
        remotes.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        for remote in remotes {
            let local_id = by_remote
                .get(remote.remote_id.as_str())
                .map(|id| id.to_string())
                .or_else(|| remote.local_id.clone());

            let Some(local_id) = local_id else {
                let local_id = uuid::Uuid::new_v4().to_string();
                debug!(remote_id = %remote.remote_id, %local_id, "inserting remote-only event");
                out.changes.push(StoreChange::Upsert(remote.to_local(local_id.clone(), now)));
                out.notices.push((local_id, EntityChange::Created));
                continue;
            };

            if local_ahead.contains(&local_id) {
                continue;
            }

            match locals.get(&local_id) {
                Some(existing) => {
                    if matches!(existing.sync_status, SyncStatus::Conflict | SyncStatus::LocalOnly) {
                        continue;
                    }
                    // Another local row already owns this remote id.
                    if existing
                        .remote_id
                        .as_deref()
                        .is_some_and(|r| r != remote.remote_id)
                    {
                        continue;
                    }
                    let mut refreshed = existing.clone();
                    refreshed.apply_remote(remote, now);
                    refreshed.updated_at = remote.updated_at;
                    let stale = existing.content_differs(&refreshed)
                        || existing.sync_status != SyncStatus::Synced
                        || existing.remote_id.is_none();
                    if stale {
                        debug!(%local_id, remote_id = %remote.remote_id, "applying remote edit");
                        out.changes.push(StoreChange::Upsert(refreshed));
                        out.notices.push((local_id, EntityChange::Updated));
                    }
                }
                None => {
                    debug!(remote_id = %remote.remote_id, %local_id, "restoring remote event");
                    out.changes.push(StoreChange::Upsert(remote.to_local(local_id.clone(), now)));
                    out.notices.push((local_id, EntityChange::Created));
                }
            }
        }
    }

    /// Drop synced events that disappeared from the pulled window.
    fn remove_vanished(
        &self,
        locals: &HashMap<String, Event>,
        remote_cache: &HashMap<String, RemoteEvent>,
        local_ahead: &HashSet<String>,
        range: Option<&TimeRange>,
        out: &mut MergeOutput,
    ) {
        for event in locals.values() {
            let Some(remote_id) = &event.remote_id else {
                continue;
            };
            if remote_cache.contains_key(remote_id)
                || local_ahead.contains(&event.local_id)
                || event.sync_status != SyncStatus::Synced
                || !self.config.calendar_ids.contains(&event.calendar_id)
            {
                continue;
            }
            if range.is_some_and(|r| !r.overlaps(event.start, event.end)) {
                continue;
            }
            debug!(local_id = %event.local_id, %remote_id, "event deleted remotely");
            out.changes.push(StoreChange::Remove(event.local_id.clone()));
            out.notices.push((event.local_id.clone(), EntityChange::Removed));
        }
    }

    async fn push(&self, groups: Vec<PushGroup>) -> Result<Vec<PhaseRecord>, SyncError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let concurrency = self.config.push_concurrency.max(1);
        let tasks: Vec<_> = groups.into_iter().map(|g| self.push_entity(g)).collect();
        let results: Vec<Result<Vec<PhaseRecord>, SyncError>> = stream::iter(tasks)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        for result in results {
            records.extend(result?);
        }
        Ok(records)
    }

    /// Push one entity's actions in order. Stops at the first action that
    /// is not confirmed; the rest wait for a later cycle.
    async fn push_entity(&self, group: PushGroup) -> Result<Vec<PhaseRecord>, SyncError> {
        let PushGroup {
            entity_id,
            mut remote_id,
            actions,
        } = group;
        let mut records = Vec::with_capacity(actions.len());
        let mut blocked = false;

        for queued in actions {
            if blocked || !queued.is_ready(Utc::now()) {
                blocked = true;
                records.push(phase_record(&queued, ActionOutcome::Deferred));
                continue;
            }
            if !self.queue.begin_flight(&queued.id)? {
                debug!(entity_id = %entity_id, action_id = %queued.id, "action left the queue before push");
                continue;
            }
            // Pick up data coalesced after the cycle started.
            let action = self.queue.get(&queued.id)?.unwrap_or(queued);

            let outcome = match self.push_action(&action, &mut remote_id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.release(std::slice::from_ref(&action.id));
                    return Err(err);
                }
            };
            if outcome != ActionOutcome::Synchronized {
                blocked = true;
            }
            records.push(phase_record(&action, outcome));
        }
        Ok(records)
    }

    async fn push_action(
        &self,
        action: &SyncAction,
        remote_id: &mut Option<String>,
    ) -> Result<ActionOutcome, SyncError> {
        let entity_id = action.entity_id.as_str();
        let stored = self.store.get(entity_id)?;
        if remote_id.is_none() {
            *remote_id = stored.as_ref().and_then(|e| e.remote_id.clone());
        }
        let calendar_id = action
            .data
            .as_ref()
            .or(stored.as_ref())
            .map(|e| e.calendar_id.clone())
            .or_else(|| self.config.calendar_ids.first().cloned())
            .unwrap_or_else(|| "primary".to_string());

        let result: Result<Option<String>, RemoteError> = match (action.action_type, &action.data) {
            (ActionType::Create, Some(event)) => {
                self.remote.create_event(&calendar_id, event).await.map(Some)
            }
            (ActionType::Update, Some(event)) => match remote_id.as_deref() {
                Some(rid) => self
                    .remote
                    .update_event(&calendar_id, rid, event)
                    .await
                    .map(|_| None),
                None => Err(RemoteError::NotFound(format!("{entity_id} has no remote id"))),
            },
            (ActionType::Create | ActionType::Update, None) => Err(RemoteError::Rejected(format!(
                "{} without event data",
                action.action_type
            ))),
            (ActionType::Delete, _) => match remote_id.as_deref() {
                Some(rid) => match self.remote.delete_event(&calendar_id, rid).await {
                    Err(RemoteError::NotFound(_)) => {
                        debug!(entity_id, remote_id = rid, "already deleted remotely");
                        Ok(None)
                    }
                    other => other.map(|_| None),
                },
                None => Ok(None),
            },
        };

        let now = Utc::now();
        match result {
            Ok(created) => {
                let still_pending = self.queue.has_pending_for(entity_id, &action.id)?;
                match action.action_type {
                    ActionType::Create => {
                        if let Some(rid) = created {
                            self.store.set_remote_id(entity_id, &rid, now, still_pending)?;
                            *remote_id = Some(rid);
                        }
                    }
                    ActionType::Update => {
                        if let (Some(mut event), Some(_)) = (action.data.clone(), stored) {
                            event.remote_id = remote_id.clone();
                            event.last_synced_at = Some(now);
                            if event.sync_status != SyncStatus::LocalOnly {
                                event.sync_status = if still_pending {
                                    SyncStatus::Pending
                                } else {
                                    SyncStatus::Synced
                                };
                            }
                            self.store.upsert(&event)?;
                        }
                    }
                    ActionType::Delete => {
                        self.store.remove(entity_id)?;
                    }
                }
                self.queue.mark_synchronized(&action.id)?;
                debug!(entity_id, action_id = %action.id, action = %action.action_type, "action synchronized");
                let change = match action.action_type {
                    ActionType::Delete => EntityChange::Removed,
                    ActionType::Create | ActionType::Update => EntityChange::Synced,
                };
                self.notifier.entity(entity_id, change);
                Ok(ActionOutcome::Synchronized)
            }
            Err(err) if err.is_permanent() => {
                let letter = self.queue.dead_letter(&action.id, &err.to_string(), now)?;
                self.flag_conflict(&letter)?;
                Ok(ActionOutcome::DeadLettered {
                    error: err.to_string(),
                })
            }
            Err(err) => {
                let error = err.to_string();
                match self.queue.mark_failed(&action.id, &error, &self.policy, now)? {
                    FailureDisposition::Retrying {
                        retry_count,
                        next_attempt_at,
                    } => {
                        warn!(entity_id, action_id = %action.id, retry_count, %next_attempt_at, error = %error, "push failed, will retry");
                        Ok(ActionOutcome::Retrying { retry_count, error })
                    }
                    FailureDisposition::DeadLettered(letter) => {
                        self.flag_conflict(&letter)?;
                        Ok(ActionOutcome::DeadLettered { error })
                    }
                }
            }
        }
    }

    /// Drop flight marks for actions that will not be decided this cycle.
    fn release(&self, action_ids: &[String]) {
        for action_id in action_ids {
            if let Err(err) = self.queue.end_flight(action_id) {
                warn!(action_id = %action_id, error = %err, "could not release in-flight action");
            }
        }
    }

    fn flag_conflict(&self, letter: &DeadLetter) -> Result<(), SyncError> {
        let entity_id = letter.action.entity_id.as_str();
        warn!(
            entity_id,
            action_id = %letter.action.id,
            retry_count = letter.action.retry_count,
            error = %letter.error,
            "action dead-lettered"
        );
        if self.store.set_status(entity_id, SyncStatus::Conflict)?.is_some() {
            self.notifier.entity(entity_id, EntityChange::Conflict);
        }
        self.notifier.send(SyncNotification::ActionDeadLettered {
            action_id: letter.action.id.clone(),
            entity_id: entity_id.to_string(),
            error: letter.error.clone(),
        });
        Ok(())
    }
}

fn phase_record(action: &SyncAction, outcome: ActionOutcome) -> PhaseRecord {
    PhaseRecord {
        action_id: action.id.clone(),
        entity_id: action.entity_id.clone(),
        action_type: action.action_type,
        outcome,
    }
}

fn require_snapshot(
    action_type: ActionType,
    entity_id: &str,
    data: Option<Event>,
) -> Result<Event, ValidationError> {
    let event = data.ok_or_else(|| ValidationError::MissingData {
        action: action_type.to_string(),
        entity_id: entity_id.to_string(),
    })?;
    if event.local_id != entity_id {
        return Err(ValidationError::EntityMismatch {
            entity_id: entity_id.to_string(),
            data_id: event.local_id,
        });
    }
    event.validate()?;
    Ok(event)
}

fn unknown_entity(entity_id: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: "entity_id".into(),
        message: format!("no local event '{entity_id}'"),
    }
}
