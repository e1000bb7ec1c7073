//! SQLite connection setup shared by the event store and the action queue.
//!
//! Each component opens its own connection so that their locks stay
//! independent; SQLite serializes the actual writes.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use super::migrations;
use crate::error::DatabaseError;

/// Open (creating if needed) and migrate the database at `path`.
///
/// # Errors
/// Returns an error if the file cannot be opened or migrated.
pub fn open_connection(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
    Ok(conn)
}

/// Open a private in-memory database (tests and dry runs).
pub fn open_memory_connection() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    migrations::migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
    Ok(conn)
}
