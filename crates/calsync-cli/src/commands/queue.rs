//! Queue introspection.

use super::{open_engine, CliResult};

pub fn run_pending(json: bool) -> CliResult {
    let engine = open_engine()?;
    let actions: Vec<_> = engine
        .queue_snapshot()?
        .into_iter()
        .filter(|a| !a.synchronized)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&actions)?);
        return Ok(());
    }
    if actions.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for a in &actions {
        let retry = match &a.last_error {
            Some(err) => format!("  retries={} last_error={err}", a.retry_count),
            None => String::new(),
        };
        println!(
            "{}  {:<6}  {}  {}{retry}",
            a.id,
            a.action_type.as_str(),
            a.entity_id,
            a.timestamp.to_rfc3339()
        );
    }
    Ok(())
}

pub fn run_dead_letters(json: bool) -> CliResult {
    let engine = open_engine()?;
    let letters = engine.dead_letters()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&letters)?);
        return Ok(());
    }
    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }
    for letter in &letters {
        println!(
            "{}  {:<6}  {}  {}  {}",
            letter.action.id,
            letter.action.action_type.as_str(),
            letter.action.entity_id,
            letter.dead_lettered_at.to_rfc3339(),
            letter.error
        );
    }
    Ok(())
}
