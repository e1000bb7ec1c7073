//! Local event commands. Changes are recorded for the next sync.

use calsync_core::event::{Event, SyncStatus};
use calsync_core::sync::{ActionType, EntityType, RecordOutcome};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use clap::Subcommand;
use uuid::Uuid;

use super::{open_engine, CliResult};

#[derive(Subcommand)]
pub enum EventAction {
    /// Create an event
    Add {
        /// Event title
        title: String,
        /// Start, RFC 3339 (or YYYY-MM-DD with --all-day)
        #[arg(long)]
        start: String,
        /// End, RFC 3339 (or YYYY-MM-DD with --all-day, inclusive)
        #[arg(long)]
        end: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        location: Option<String>,
        /// Comma-separated tag ids
        #[arg(long)]
        tags: Option<String>,
        /// Calendar id (default: first configured calendar)
        #[arg(long)]
        calendar: Option<String>,
        #[arg(long)]
        all_day: bool,
        /// Keep as a local draft that is never pushed
        #[arg(long)]
        local_only: bool,
    },
    /// Update an event
    Update {
        /// Local event id
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        location: Option<String>,
        /// Comma-separated tag ids
        #[arg(long)]
        tags: Option<String>,
        /// Turn a local draft into a synced event
        #[arg(long)]
        publish: bool,
    },
    /// Delete an event
    Delete {
        /// Local event id
        id: String,
    },
    /// List local events
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one event
    Show {
        /// Local or remote event id
        id: String,
    },
}

pub fn run(action: EventAction) -> CliResult {
    let engine = open_engine()?;

    match action {
        EventAction::Add {
            title,
            start,
            end,
            description,
            location,
            tags,
            calendar,
            all_day,
            local_only,
        } => {
            let calendar_id = calendar
                .or_else(|| engine.config().calendar_ids.first().cloned())
                .unwrap_or_else(|| "primary".to_string());
            let start = parse_time(&start)?;
            let mut end = parse_time(&end)?;
            if all_day {
                end += chrono::Duration::days(1);
            }

            let id = Uuid::new_v4().to_string();
            let mut event = Event::new(&id, calendar_id, title, start, end);
            event.all_day = all_day;
            event.description = description.unwrap_or_default();
            event.location = location.unwrap_or_default();
            event.tag_ids = tags.map(|t| split_tags(&t)).unwrap_or_default();
            if local_only {
                event.sync_status = SyncStatus::LocalOnly;
            }

            let outcome =
                engine.record_local_action(ActionType::Create, EntityType::Event, &id, Some(event))?;
            println!("Event created: {id}");
            print_outcome(&outcome);
        }
        EventAction::Update {
            id,
            title,
            start,
            end,
            description,
            location,
            tags,
            publish,
        } => {
            let mut event = engine
                .store()
                .get(&id)?
                .ok_or_else(|| format!("event not found: {id}"))?;
            if let Some(title) = title {
                event.title = title;
            }
            if let Some(start) = start {
                event.start = parse_time(&start)?;
            }
            if let Some(end) = end {
                event.end = parse_time(&end)?;
            }
            if let Some(description) = description {
                event.description = description;
            }
            if let Some(location) = location {
                event.location = location;
            }
            if let Some(tags) = tags {
                event.tag_ids = split_tags(&tags);
            }
            if publish {
                event.sync_status = SyncStatus::Pending;
            }
            event.updated_at = Utc::now();

            let outcome =
                engine.record_local_action(ActionType::Update, EntityType::Event, &id, Some(event))?;
            println!("Event updated: {id}");
            print_outcome(&outcome);
        }
        EventAction::Delete { id } => {
            let outcome = engine.record_local_action(ActionType::Delete, EntityType::Event, &id, None)?;
            println!("Event deleted: {id}");
            print_outcome(&outcome);
        }
        EventAction::List { json } => {
            let mut events = engine.store().list()?;
            events.sort_by_key(|e| e.start);
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No events.");
            } else {
                for e in &events {
                    println!(
                        "{}  {:<10}  {}  {}",
                        e.local_id,
                        e.sync_status.as_str(),
                        e.start.format("%Y-%m-%d %H:%M"),
                        e.title
                    );
                }
            }
        }
        EventAction::Show { id } => {
            let event = match engine.store().get(&id)? {
                Some(event) => event,
                None => engine
                    .store()
                    .find_by_remote_id(&id)?
                    .ok_or_else(|| format!("event not found: {id}"))?,
            };
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
    }
    Ok(())
}

fn print_outcome(outcome: &RecordOutcome) {
    match outcome {
        RecordOutcome::Appended(action) => println!("Queued {} ({})", action.action_type, action.id),
        RecordOutcome::Coalesced(action) => {
            println!("Merged into queued {} ({})", action.action_type, action.id)
        }
        RecordOutcome::Discarded { superseded } => {
            println!("Never synced; dropped {superseded} queued action(s)")
        }
        RecordOutcome::KeptLocal => println!("Local draft; not queued"),
    }
}

/// RFC 3339 timestamp, or a bare date at UTC midnight.
fn parse_time(input: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt);
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| format!("invalid time '{input}': expected RFC 3339 or YYYY-MM-DD"))?;
    let utc = FixedOffset::east_opt(0).ok_or("invalid offset")?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc().with_timezone(&utc))
        .ok_or_else(|| format!("invalid date '{input}'"))
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
