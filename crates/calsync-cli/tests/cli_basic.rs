//! Basic CLI E2E tests.
//!
//! Each test runs the binary against its own data directory; none of them
//! reach the network.

use std::path::Path;
use std::process::Command;

/// Run a CLI command and return (stdout, stderr, exit code).
fn run_cli(data_dir: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_calsync"))
        .args(args)
        .env("CALSYNC_DATA_DIR", data_dir)
        .env("CALSYNC_LOG", "warn")
        .env_remove("CALSYNC_ACCESS_TOKEN")
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (stdout, stderr, code)
}

fn run_cli_success(data_dir: &Path, args: &[&str]) -> String {
    let (stdout, stderr, code) = run_cli(data_dir, args);
    assert_eq!(code, 0, "CLI command failed: {args:?}\n{stderr}");
    stdout
}

fn add_event(data_dir: &Path, title: &str, extra: &[&str]) -> String {
    let mut args = vec![
        "event",
        "add",
        title,
        "--start",
        "2026-05-01T09:00:00+00:00",
        "--end",
        "2026-05-01T10:00:00+00:00",
    ];
    args.extend_from_slice(extra);
    let out = run_cli_success(data_dir, &args);
    out.lines()
        .find_map(|l| l.strip_prefix("Event created: "))
        .expect("created id")
        .trim()
        .to_string()
}

fn list_json(data_dir: &Path, args: &[&str]) -> Vec<serde_json::Value> {
    let out = run_cli_success(data_dir, args);
    serde_json::from_str::<serde_json::Value>(&out)
        .expect("JSON output")
        .as_array()
        .cloned()
        .unwrap_or_default()
}

#[test]
fn test_event_add_queues_create() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_event(dir.path(), "Standup", &[]);

    let events = list_json(dir.path(), &["event", "list", "--json"]);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["local_id"], id.as_str());
    assert_eq!(events[0]["sync_status"], "pending");

    let queued = list_json(dir.path(), &["queue", "--json"]);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["action_type"], "create");
}

#[test]
fn test_event_update_coalesces() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_event(dir.path(), "Draft", &[]);

    let out = run_cli_success(dir.path(), &["event", "update", &id, "--title", "Final"]);
    assert!(out.contains("Merged into queued create"));

    let queued = list_json(dir.path(), &["queue", "--json"]);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["data"]["title"], "Final");
}

#[test]
fn test_event_delete_never_synced() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_event(dir.path(), "Scratch", &[]);

    let out = run_cli_success(dir.path(), &["event", "delete", &id]);
    assert!(out.contains("Never synced"));
    assert!(list_json(dir.path(), &["event", "list", "--json"]).is_empty());
    assert!(list_json(dir.path(), &["queue", "--json"]).is_empty());
}

#[test]
fn test_local_only_event_not_queued() {
    let dir = tempfile::tempdir().unwrap();
    let id = add_event(dir.path(), "Private", &["--local-only"]);

    assert!(list_json(dir.path(), &["queue", "--json"]).is_empty());
    let shown = run_cli_success(dir.path(), &["event", "show", &id]);
    assert!(shown.contains("local_only"));
}

#[test]
fn test_event_add_rejects_backwards_range() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stderr, code) = run_cli(
        dir.path(),
        &[
            "event",
            "add",
            "Backwards",
            "--start",
            "2026-05-01T10:00:00+00:00",
            "--end",
            "2026-05-01T09:00:00+00:00",
        ],
    );
    assert_ne!(code, 0);
    assert!(stderr.contains("error"));
}

#[test]
fn test_status_json() {
    let dir = tempfile::tempdir().unwrap();
    add_event(dir.path(), "Counted", &[]);

    let out = run_cli_success(dir.path(), &["status", "--json"]);
    let state: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(state["pending_count"], 1);
    assert_eq!(state["dead_letter_count"], 0);
    assert!(state["last_sync_at"].is_null());
}

#[test]
fn test_sync_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let (_, stderr, code) = run_cli(dir.path(), &["sync"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("CALSYNC_ACCESS_TOKEN"));
}

#[test]
fn test_config_get_set() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(run_cli_success(dir.path(), &["config", "get", "max_retries"]).trim(), "5");

    run_cli_success(dir.path(), &["config", "set", "incremental_window.days_ahead", "30"]);
    assert_eq!(
        run_cli_success(dir.path(), &["config", "get", "incremental_window.days_ahead"]).trim(),
        "30"
    );

    let (_, _, code) = run_cli(dir.path(), &["config", "set", "push_concurrency", "0"]);
    assert_ne!(code, 0);
    let (_, _, code) = run_cli(dir.path(), &["config", "get", "no_such_key"]);
    assert_ne!(code, 0);
}

#[test]
fn test_dead_letters_empty() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_cli_success(dir.path(), &["dead-letters"]);
    assert!(out.contains("No dead letters."));
}
