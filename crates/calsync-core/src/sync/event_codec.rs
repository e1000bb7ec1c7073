//! Encoding/decoding between local events and Google Calendar JSON.
//!
//! The local id and tag ids travel in `extendedProperties.private` so an
//! event created here can be matched back to its local row after a pull.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::event::{Event, RemoteEvent};
use crate::sync::types::RemoteError;

pub const LOCAL_ID_PROPERTY: &str = "calsync_local_id";
pub const TAGS_PROPERTY: &str = "calsync_tag_ids";

// ============================================================================
// Local -> Google
// ============================================================================

/// Convert a local event to a Google Calendar event body.
pub fn to_gcal_event(event: &Event) -> Value {
    let (start, end) = if event.all_day {
        let start_date = event.start.date_naive();
        let mut end_date = event.end.date_naive();
        // Google's all-day end date is exclusive.
        if end_date <= start_date || event.end.time() != chrono::NaiveTime::MIN {
            end_date = end_date.succ_opt().unwrap_or(end_date);
        }
        (
            json!({ "date": start_date.format("%Y-%m-%d").to_string() }),
            json!({ "date": end_date.format("%Y-%m-%d").to_string() }),
        )
    } else {
        (
            json!({ "dateTime": event.start.to_rfc3339() }),
            json!({ "dateTime": event.end.to_rfc3339() }),
        )
    };

    json!({
        "summary": event.title,
        "description": event.description,
        "location": event.location,
        "start": start,
        "end": end,
        "extendedProperties": {
            "private": {
                LOCAL_ID_PROPERTY: event.local_id,
                TAGS_PROPERTY: event.tag_ids.join(","),
            }
        }
    })
}

// ============================================================================
// Google -> Local
// ============================================================================

/// Parse one item of an events listing.
///
/// Returns `Ok(None)` for cancelled entries, which Google reports for
/// deleted recurring instances.
pub fn parse_gcal_event(calendar_id: &str, item: &Value) -> Result<Option<RemoteEvent>, RemoteError> {
    if item["status"].as_str() == Some("cancelled") {
        return Ok(None);
    }

    let remote_id = item["id"]
        .as_str()
        .ok_or_else(|| malformed("missing id"))?
        .to_string();
    let (start, all_day) = parse_time(&item["start"]).ok_or_else(|| malformed("missing start"))?;
    let (end, _) = parse_time(&item["end"]).ok_or_else(|| malformed("missing end"))?;
    let updated_at = item["updated"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| malformed("missing updated"))?;

    let private = &item["extendedProperties"]["private"];
    let tag_ids = private[TAGS_PROPERTY]
        .as_str()
        .map(|tags| {
            tags.split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(RemoteEvent {
        remote_id,
        calendar_id: calendar_id.to_string(),
        title: item["summary"].as_str().unwrap_or("(No title)").to_string(),
        description: item["description"].as_str().unwrap_or_default().to_string(),
        start,
        end,
        all_day,
        location: item["location"].as_str().unwrap_or_default().to_string(),
        tag_ids,
        local_id: private[LOCAL_ID_PROPERTY].as_str().map(str::to_string),
        updated_at,
    }))
}

/// Parse the `items` array of a listing response, skipping cancelled entries.
pub fn parse_gcal_items(calendar_id: &str, body: &Value) -> Result<Vec<RemoteEvent>, RemoteError> {
    let Some(items) = body["items"].as_array() else {
        return Ok(Vec::new());
    };
    let mut events = Vec::with_capacity(items.len());
    for item in items {
        if let Some(event) = parse_gcal_event(calendar_id, item)? {
            events.push(event);
        }
    }
    Ok(events)
}

/// `{dateTime}` or all-day `{date}` (midnight UTC).
fn parse_time(value: &Value) -> Option<(DateTime<FixedOffset>, bool)> {
    if let Some(raw) = value["dateTime"].as_str() {
        return DateTime::parse_from_rfc3339(raw).ok().map(|t| (t, false));
    }
    let date = NaiveDate::parse_from_str(value["date"].as_str()?, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc().fixed_offset();
    Some((midnight, true))
}

fn malformed(what: &str) -> RemoteError {
    RemoteError::Rejected(format!("malformed event: {what}"))
}
