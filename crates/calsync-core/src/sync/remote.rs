//! Remote calendar capability and the adapter the orchestrator talks to.
//!
//! [`RemoteCalendar`] is the raw service interface. [`RemoteAdapter`] wraps
//! it with a per-call timeout, page draining and a single token refresh on
//! authentication failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{Event, RemoteEvent};
use crate::sync::types::RemoteError;

/// Half-open UTC interval `[start, end)` used to bound a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Whether an event spanning `[start, end]` intersects this range.
    pub fn overlaps(&self, start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> bool {
        let start = start.with_timezone(&Utc);
        let end = end.with_timezone(&Utc);
        start < self.end && (end > self.start || (start == end && self.contains(start)))
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<RemoteEvent>,
    pub next_page_token: Option<String>,
}

/// Remote calendar service.
#[async_trait]
pub trait RemoteCalendar: Send + Sync {
    async fn list_events(
        &self,
        calendar_id: &str,
        range: Option<&TimeRange>,
        page_token: Option<&str>,
    ) -> Result<EventPage, RemoteError>;

    /// Returns the remote id assigned to the new event.
    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<String, RemoteError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        remote_id: &str,
        event: &Event,
    ) -> Result<(), RemoteError>;

    async fn delete_event(&self, calendar_id: &str, remote_id: &str) -> Result<(), RemoteError>;
}

/// Supplies and renews the bearer credential.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, RemoteError>;

    /// Obtain a fresh token after the remote reported it expired.
    async fn refresh(&self) -> Result<(), RemoteError>;
}

/// A fixed token, e.g. from `CALSYNC_ACCESS_TOKEN`. Cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, RemoteError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<(), RemoteError> {
        Err(RemoteError::AuthExpired)
    }
}

/// Timeout, paging and auth-refresh wrapper around a [`RemoteCalendar`].
#[derive(Clone)]
pub struct RemoteAdapter {
    remote: Arc<dyn RemoteCalendar>,
    tokens: Option<Arc<dyn TokenProvider>>,
    timeout: Duration,
}

impl RemoteAdapter {
    pub fn new(remote: Arc<dyn RemoteCalendar>, timeout: Duration) -> Self {
        Self {
            remote,
            tokens: None,
            timeout,
        }
    }

    /// Refresh through `tokens` once when a call reports [`RemoteError::AuthExpired`].
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drain every page for `calendar_id`.
    pub async fn fetch_all(
        &self,
        calendar_id: &str,
        range: Option<&TimeRange>,
    ) -> Result<Vec<RemoteEvent>, RemoteError> {
        let mut events = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page_token = token.as_deref();
            let page = self
                .call("list_events", || {
                    self.remote.list_events(calendar_id, range, page_token)
                })
                .await?;
            events.extend(page.events);
            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        debug!(calendar_id, count = events.len(), "pulled remote events");
        Ok(events)
    }

    pub async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<String, RemoteError> {
        self.call("create_event", || self.remote.create_event(calendar_id, event))
            .await
    }

    pub async fn update_event(
        &self,
        calendar_id: &str,
        remote_id: &str,
        event: &Event,
    ) -> Result<(), RemoteError> {
        self.call("update_event", || {
            self.remote.update_event(calendar_id, remote_id, event)
        })
        .await
    }

    pub async fn delete_event(&self, calendar_id: &str, remote_id: &str) -> Result<(), RemoteError> {
        self.call("delete_event", || self.remote.delete_event(calendar_id, remote_id))
            .await
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        match self.timed(f()).await {
            Err(RemoteError::AuthExpired) => {
                let Some(tokens) = &self.tokens else {
                    return Err(RemoteError::Transient(format!(
                        "{op}: authentication expired and no refresh is available"
                    )));
                };
                if let Err(err) = tokens.refresh().await {
                    warn!(op, error = %err, "token refresh failed");
                    return Err(RemoteError::Transient(format!("{op}: token refresh failed: {err}")));
                }
                match self.timed(f()).await {
                    Err(RemoteError::AuthExpired) => Err(RemoteError::Transient(format!(
                        "{op}: authentication still rejected after refresh"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(RemoteError::Timeout(self.timeout)))
    }
}
