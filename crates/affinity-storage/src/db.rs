//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::info;

use affinity_core::error::AffinityError;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// Uses WAL mode for concurrent read/write safety. The connection is
/// wrapped in a Mutex since rusqlite Connection is not Sync.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, and runs all pending migrations.
    pub fn new(path: &Path) -> Result<Self, AffinityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| {
            AffinityError::StoreUnavailable(format!("Failed to open database: {}", e))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -65536;",
        )
        .map_err(|e| AffinityError::StoreUnavailable(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, AffinityError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            AffinityError::StoreUnavailable(format!("Failed to open in-memory db: {}", e))
        })?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, AffinityError>
    where
        F: FnOnce(&Connection) -> Result<T, AffinityError>,
    {
        let conn = self.conn.lock().map_err(|e| {
            AffinityError::StoreUnavailable(format!("Database lock poisoned: {}", e))
        })?;
        f(&conn)
    }

    /// Like [`with_conn`](Self::with_conn) but with a mutable connection, for
    /// work that needs a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, AffinityError>
    where
        F: FnOnce(&mut Connection) -> Result<T, AffinityError>,
    {
        let mut conn = self.conn.lock().map_err(|e| {
            AffinityError::StoreUnavailable(format!("Database lock poisoned: {}", e))
        })?;
        f(&mut conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Run blocking database work off the async executor.
pub(crate) async fn run_blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T, AffinityError>
where
    F: FnOnce(&Database) -> Result<T, AffinityError> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| AffinityError::StoreUnavailable(format!("Database task panicked: {}", e)))?
}

/// Map a rusqlite error into the store-unavailable taxonomy.
pub(crate) fn sql_err(context: &str) -> impl Fn(rusqlite::Error) -> AffinityError + '_ {
    move |e| AffinityError::StoreUnavailable(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
                .map_err(sql_err("count"))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("affinity.db");
        let db = Database::new(&path).unwrap();

        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))
                .map_err(sql_err("count"))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("wal.db")).unwrap();
        db.with_conn(|conn| {
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(sql_err("pragma"))?;
            assert_eq!(mode, "wal");
            Ok(())
        })
        .unwrap();
    }
}
