//! In-memory remote calendar with failure injection, delays and a call log.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use calsync_core::event::{Event, RemoteEvent};
use calsync_core::storage::SyncConfig;
use calsync_core::sync::{EventPage, RemoteAdapter, RemoteCalendar, RemoteError, SyncEngine, TimeRange};
use chrono::{DateTime, FixedOffset, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub remote_id: Option<String>,
    pub local_id: Option<String>,
    pub title: Option<String>,
}

#[derive(Default)]
struct FakeState {
    events: BTreeMap<String, RemoteEvent>,
    next_id: u64,
    offline: bool,
    fail_next: VecDeque<(Op, RemoteError)>,
    fail_always: HashMap<Op, RemoteError>,
    op_delay: HashMap<Op, Duration>,
    local_delay: HashMap<String, Duration>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeCalendar {
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    page_size: usize,
}

impl FakeCalendar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            page_size: 3,
            ..Default::default()
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn fail_next(&self, op: Op, err: RemoteError) {
        self.state.lock().unwrap().fail_next.push_back((op, err));
    }

    pub fn fail_always(&self, op: Op, err: RemoteError) {
        self.state.lock().unwrap().fail_always.insert(op, err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_next.clear();
        state.fail_always.clear();
    }

    pub fn delay_op(&self, op: Op, delay: Duration) {
        self.state.lock().unwrap().op_delay.insert(op, delay);
    }

    /// Delay pushes carrying this local id.
    pub fn delay_local(&self, local_id: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .local_delay
            .insert(local_id.to_string(), delay);
    }

    /// Add an event created by some other client.
    pub fn insert_remote(&self, mut event: RemoteEvent) -> String {
        let mut state = self.state.lock().unwrap();
        if event.remote_id.is_empty() {
            state.next_id += 1;
            event.remote_id = format!("remote-{}", state.next_id);
        }
        let id = event.remote_id.clone();
        state.events.insert(id.clone(), event);
        id
    }

    /// Simulate an edit made elsewhere.
    pub fn edit_remote(&self, remote_id: &str, title: &str, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let event = state.events.get_mut(remote_id).expect("remote event exists");
        event.title = title.to_string();
        event.updated_at = updated_at;
    }

    pub fn remove_remote(&self, remote_id: &str) {
        self.state.lock().unwrap().events.remove(remote_id);
    }

    pub fn events(&self) -> Vec<RemoteEvent> {
        self.state.lock().unwrap().events.values().cloned().collect()
    }

    pub fn find_by_local(&self, local_id: &str) -> Vec<RemoteEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.local_id.as_deref() == Some(local_id))
            .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Log the call, sleep for any configured delay, then return an injected failure if any.
    async fn enter(&self, call: Call) -> Result<(), RemoteError> {
        let (delay, failure) = {
            let mut state = self.state.lock().unwrap();
            let op = call.op;
            let delay = call
                .local_id
                .as_ref()
                .and_then(|id| state.local_delay.get(id).copied())
                .or_else(|| state.op_delay.get(&op).copied());
            state.calls.push(call);

            let failure = if state.offline {
                Some(RemoteError::Transient("offline".into()))
            } else if let Some(pos) = state.fail_next.iter().position(|(o, _)| *o == op) {
                state.fail_next.remove(pos).map(|(_, err)| err)
            } else {
                state.fail_always.get(&op).cloned()
            };
            (delay, failure)
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        failure.map_or(Ok(()), Err)
    }

    fn to_remote(&self, remote_id: String, calendar_id: &str, event: &Event) -> RemoteEvent {
        RemoteEvent {
            remote_id,
            calendar_id: calendar_id.to_string(),
            title: event.title.clone(),
            description: event.description.clone(),
            start: event.start,
            end: event.end,
            all_day: event.all_day,
            location: event.location.clone(),
            tag_ids: event.tag_ids.clone(),
            local_id: Some(event.local_id.clone()),
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl RemoteCalendar for FakeCalendar {
    async fn list_events(
        &self,
        calendar_id: &str,
        range: Option<&TimeRange>,
        page_token: Option<&str>,
    ) -> Result<EventPage, RemoteError> {
        self.enter(Call {
            op: Op::List,
            remote_id: None,
            local_id: None,
            title: None,
        })
        .await?;

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let matching: Vec<RemoteEvent> = self
            .events()
            .into_iter()
            .filter(|e| e.calendar_id == calendar_id)
            .filter(|e| range.map_or(true, |r| r.overlaps(e.start, e.end)))
            .collect();
        let page: Vec<RemoteEvent> = matching.iter().skip(offset).take(self.page_size).cloned().collect();
        let next = offset + page.len();
        Ok(EventPage {
            events: page,
            next_page_token: (next < matching.len()).then(|| next.to_string()),
        })
    }

    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<String, RemoteError> {
        self.enter(Call {
            op: Op::Create,
            remote_id: None,
            local_id: Some(event.local_id.clone()),
            title: Some(event.title.clone()),
        })
        .await?;
        let remote_id = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            format!("remote-{}", state.next_id)
        };
        let remote = self.to_remote(remote_id.clone(), calendar_id, event);
        self.state
            .lock()
            .unwrap()
            .events
            .insert(remote_id.clone(), remote);
        Ok(remote_id)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        remote_id: &str,
        event: &Event,
    ) -> Result<(), RemoteError> {
        self.enter(Call {
            op: Op::Update,
            remote_id: Some(remote_id.to_string()),
            local_id: Some(event.local_id.clone()),
            title: Some(event.title.clone()),
        })
        .await?;
        let remote = self.to_remote(remote_id.to_string(), calendar_id, event);
        let mut state = self.state.lock().unwrap();
        if !state.events.contains_key(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        state.events.insert(remote_id.to_string(), remote);
        Ok(())
    }

    async fn delete_event(&self, _calendar_id: &str, remote_id: &str) -> Result<(), RemoteError> {
        self.enter(Call {
            op: Op::Delete,
            remote_id: Some(remote_id.to_string()),
            local_id: None,
            title: None,
        })
        .await?;
        match self.state.lock().unwrap().events.remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(remote_id.to_string())),
        }
    }
}

/// Config with no backoff delay so retries are ready on the next cycle.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        call_timeout_secs: 2,
        ..SyncConfig::default()
    }
}

pub fn adapter(fake: &Arc<FakeCalendar>) -> RemoteAdapter {
    RemoteAdapter::new(fake.clone(), Duration::from_secs(2))
}

pub fn memory_engine(fake: &Arc<FakeCalendar>, config: SyncConfig) -> SyncEngine {
    let adapter = RemoteAdapter::new(fake.clone(), config.call_timeout());
    SyncEngine::open_memory(adapter, config).unwrap()
}

pub fn file_engine(fake: &Arc<FakeCalendar>, path: &Path, config: SyncConfig) -> SyncEngine {
    let adapter = RemoteAdapter::new(fake.clone(), config.call_timeout());
    SyncEngine::open(path, adapter, config).unwrap()
}

/// An hour-long event starting an hour from now.
pub fn event(id: &str, title: &str) -> Event {
    let tz = FixedOffset::east_opt(0).unwrap();
    let start = (Utc::now() + chrono::Duration::hours(1)).with_timezone(&tz);
    Event::new(id, "primary", title, start, start + chrono::Duration::hours(1))
}

pub fn remote_event(title: &str, local_id: Option<&str>) -> RemoteEvent {
    let local = event("unused", title);
    RemoteEvent {
        remote_id: String::new(),
        calendar_id: "primary".into(),
        title: title.into(),
        description: String::new(),
        start: local.start,
        end: local.end,
        all_day: false,
        location: String::new(),
        tag_ids: Vec::new(),
        local_id: local_id.map(str::to_string),
        updated_at: Utc::now(),
    }
}
