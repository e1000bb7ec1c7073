//! Sync cycle commands against Google Calendar.

use calsync_core::sync::{ActionOutcome, CycleReport, SyncNotification};
use tokio::sync::broadcast::error::RecvError;

use super::{open_engine, require_token, CliResult};

/// Run a single forced cycle and print its outcome.
pub fn run_sync(full: bool) -> CliResult {
    require_token()?;
    let engine = open_engine()?;
    if full {
        engine.trigger_full_sync();
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(engine.force_sync())? {
        CycleReport::Completed(cycle) => {
            let synchronized = cycle.count(|o| matches!(o, ActionOutcome::Synchronized));
            let superseded = cycle.count(|o| matches!(o, ActionOutcome::SupersededByRemote));
            let retrying = cycle.count(|o| matches!(o, ActionOutcome::Retrying { .. }));
            let dead = cycle.count(|o| matches!(o, ActionOutcome::DeadLettered { .. }));
            let kind = if cycle.is_full_sync { "full" } else { "incremental" };
            println!("Sync complete ({kind})");
            println!("  pushed:       {synchronized}");
            println!("  remote won:   {superseded}");
            println!("  retrying:     {retrying}");
            println!("  dead-letter:  {dead}");
            println!("  still queued: {}", engine.pending_actions_count()?);
        }
        CycleReport::Skipped => println!("A sync cycle is already running."),
    }
    Ok(())
}

/// Start the periodic timer and report notifications until Ctrl-C. The
/// runtime is only dropped once no cycle is in flight.
pub fn run_daemon() -> CliResult {
    require_token()?;
    let engine = open_engine()?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut rx = engine.subscribe();
        engine.start();
        println!(
            "Syncing every {}s. Press Ctrl-C to stop.",
            engine.config().interval().as_secs()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                received = rx.recv() => match received {
                    Ok(notification) => print_notification(&notification),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "notification receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        println!("Stopping; waiting for the running cycle.");
        engine.shutdown().await;
    });
    println!("Stopped.");
    Ok(())
}

pub fn run_status(json: bool) -> CliResult {
    let engine = open_engine()?;
    let state = engine.state()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }
    match state.last_sync_at {
        Some(at) => println!("Last sync:    {}", at.to_rfc3339()),
        None => println!("Last sync:    never"),
    }
    println!("Pending:      {}", state.pending_count);
    println!("Dead letters: {}", state.dead_letter_count);
    println!("Events:       {}", engine.store().len()?);
    Ok(())
}

fn print_notification(notification: &SyncNotification) {
    match notification {
        SyncNotification::CycleStarted {
            is_full_sync,
            queue_len,
        } => {
            let kind = if *is_full_sync { "full" } else { "incremental" };
            println!("cycle started ({kind}, {queue_len} queued)");
        }
        SyncNotification::CycleCompleted { queue_len, .. } => {
            println!("cycle completed ({queue_len} queued)");
        }
        SyncNotification::CycleAborted { error } => println!("cycle aborted: {error}"),
        SyncNotification::EntityChanged { local_id, change } => {
            println!("  {local_id}: {change:?}");
        }
        SyncNotification::ActionDeadLettered {
            entity_id, error, ..
        } => println!("  {entity_id}: gave up ({error})"),
    }
}
