//! Google Calendar API client for sync operations.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::event::Event;
use crate::sync::event_codec::{parse_gcal_items, to_gcal_event};
use crate::sync::remote::{EventPage, RemoteCalendar, TimeRange, TokenProvider};
use crate::sync::types::RemoteError;

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3/";

/// Google Calendar API client.
pub struct GoogleCalendar {
    http: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl GoogleCalendar {
    /// Client against the public Google endpoint.
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, tokens)
    }

    /// Client against `base_url` (tests point this at a mock server).
    pub fn with_base_url(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Result<Self, RemoteError> {
        let mut raw = base_url.to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| RemoteError::Rejected(format!("invalid base url {raw}: {e}")))?;
        Ok(Self {
            http: Client::new(),
            base_url,
            tokens,
        })
    }

    pub(crate) fn events_url(&self, calendar_id: &str, remote_id: Option<&str>) -> Result<Url, RemoteError> {
        let mut path = format!("calendars/{}/events", urlencoding::encode(calendar_id));
        if let Some(id) = remote_id {
            path.push('/');
            path.push_str(&urlencoding::encode(id));
        }
        self.base_url
            .join(&path)
            .map_err(|e| RemoteError::Rejected(format!("invalid url: {e}")))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let token = self.tokens.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Map an HTTP failure to the retry classification.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::AuthExpired,
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
        // Google reports quota exhaustion as 403 with a rate-limit reason.
        StatusCode::FORBIDDEN if body.contains("rateLimitExceeded") => RemoteError::RateLimited,
        StatusCode::REQUEST_TIMEOUT => RemoteError::Transient(detail),
        s if s.is_server_error() => RemoteError::Transient(detail),
        _ => RemoteError::Rejected(detail),
    }
}

#[async_trait]
impl RemoteCalendar for GoogleCalendar {
    async fn list_events(
        &self,
        calendar_id: &str,
        range: Option<&TimeRange>,
        page_token: Option<&str>,
    ) -> Result<EventPage, RemoteError> {
        let mut url = self.events_url(calendar_id, None)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("singleEvents", "true");
            query.append_pair("maxResults", "250");
            if let Some(range) = range {
                query.append_pair("timeMin", &range.start.to_rfc3339());
                query.append_pair("timeMax", &range.end.to_rfc3339());
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let body: Value = self
            .send(self.http.get(url))
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let events = parse_gcal_items(calendar_id, &body)?;
        debug!(calendar_id, count = events.len(), "fetched events page");
        Ok(EventPage {
            events,
            next_page_token: body["nextPageToken"].as_str().map(str::to_string),
        })
    }

    async fn create_event(&self, calendar_id: &str, event: &Event) -> Result<String, RemoteError> {
        let url = self.events_url(calendar_id, None)?;
        let body: Value = self
            .send(self.http.post(url).json(&to_gcal_event(event)))
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Rejected("missing event id in response".into()))
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        remote_id: &str,
        event: &Event,
    ) -> Result<(), RemoteError> {
        let url = self.events_url(calendar_id, Some(remote_id))?;
        self.send(self.http.put(url).json(&to_gcal_event(event)))
            .await?;
        Ok(())
    }

    async fn delete_event(&self, calendar_id: &str, remote_id: &str) -> Result<(), RemoteError> {
        let url = self.events_url(calendar_id, Some(remote_id))?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }
}
