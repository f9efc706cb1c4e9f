//! # sca-store: SQLite persistence for jobs and result trees
//!
//! - [`jobs`]: job records and their status transitions, each one a single
//!   transaction.
//! - [`predicate`]: compiles validated filters into SQL fragments.
//! - [`pagination`]: the two-phase paged read of a job's result tree.
//!
//! One connection, shared behind a mutex. Callers hold it for the length of
//! one statement or transaction.

#![forbid(unsafe_code)]

mod error;
pub mod jobs;
pub mod pagination;
pub mod predicate;
mod schema;

pub use error::StoreError;
pub use pagination::ResultPager;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        tracing::info!(path = %path.display(), "opened job store");
        Self::init(conn)
    }

    /// Private database that vanishes with the store. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::install_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A panic while holding the connection leaves no half-open transaction
    /// (rusqlite rolls back on drop), so a poisoned lock is still usable.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sca.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());

        let version: String = store
            .conn()
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sca.db");
        drop(SqliteStore::open(&path).unwrap());
        assert!(SqliteStore::open(&path).is_ok());
    }
}
