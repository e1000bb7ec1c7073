mod config;
pub mod database;
pub mod event_store;
pub mod migrations;

pub use config::{SyncConfig, WindowConfig};
pub use database::{open_connection, open_memory_connection};
pub use event_store::{EventStore, StoreChange};

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns `~/.config/calsync[-dev]/` based on CALSYNC_ENV.
///
/// Set CALSYNC_ENV=dev to use the development data directory, or
/// CALSYNC_DATA_DIR to point somewhere else entirely.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("CALSYNC_DATA_DIR") {
        Some(custom) => PathBuf::from(custom),
        None => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");

            let env = std::env::var("CALSYNC_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("calsync-dev")
            } else {
                base_dir.join("calsync")
            }
        }
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}

/// Path of the SQLite database inside [`data_dir`].
pub fn database_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("calsync.db"))
}
