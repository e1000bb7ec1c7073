pub mod config;
pub mod event;
pub mod queue;
pub mod sync;

use std::error::Error;
use std::sync::Arc;

use calsync_core::storage::{database_path, SyncConfig};
use calsync_core::sync::{GoogleCalendar, RemoteAdapter, StaticToken, SyncEngine, TokenProvider};

pub type CliResult = Result<(), Box<dyn Error>>;

/// Bearer token for the Google Calendar API.
pub const TOKEN_ENV: &str = "CALSYNC_ACCESS_TOKEN";

/// Engine over the on-disk database. Local commands never reach the
/// remote, so a missing token only matters for `sync` and `daemon`.
pub fn open_engine() -> calsync_core::error::Result<SyncEngine> {
    let config = SyncConfig::load()?;
    let token = std::env::var(TOKEN_ENV).unwrap_or_default();
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(token));
    let client = GoogleCalendar::new(Arc::clone(&tokens))?;
    let adapter =
        RemoteAdapter::new(Arc::new(client), config.call_timeout()).with_token_provider(tokens);
    Ok(SyncEngine::open(&database_path()?, adapter, config)?)
}

pub fn require_token() -> CliResult {
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => Ok(()),
        _ => Err(format!("{TOKEN_ENV} is not set").into()),
    }
}
