//! Database schema migrations.
//!
//! Applies the schema for embedding records, owner profiles, and the store
//! epoch counter.

use rusqlite::Connection;
use tracing::info;

use affinity_core::error::AffinityError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), AffinityError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| {
        AffinityError::StoreUnavailable(format!("Failed to create migrations table: {}", e))
    })?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| {
            AffinityError::StoreUnavailable(format!("Failed to query migration version: {}", e))
        })?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), AffinityError> {
    conn.execute_batch(
        "
        -- Embedding records. The vector is kept as a JSON list and parsed into
        -- a fixed-length vector on read.
        CREATE TABLE IF NOT EXISTS embeddings (
            id              TEXT PRIMARY KEY NOT NULL,
            owner_id        TEXT NOT NULL,
            agent_id        TEXT,
            embedding       TEXT NOT NULL,
            embedding_type  TEXT NOT NULL,
            data_type       TEXT,
            source_ref      TEXT,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_embeddings_key
            ON embeddings (owner_id, embedding_type);

        CREATE INDEX IF NOT EXISTS idx_embeddings_type
            ON embeddings (embedding_type);

        -- Owner profiles and their matching preferences.
        CREATE TABLE IF NOT EXISTS profiles (
            owner_id            TEXT PRIMARY KEY NOT NULL,
            gender              TEXT,
            verified            INTEGER NOT NULL DEFAULT 0,
            preferred_genders   TEXT NOT NULL DEFAULT '[]',
            require_verified    INTEGER NOT NULL DEFAULT 0,
            metadata            TEXT NOT NULL DEFAULT '{}',
            updated_at          INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_profiles_verified
            ON profiles (verified);

        -- Monotonic mutation counter for the record store.
        CREATE TABLE IF NOT EXISTS store_meta (
            key     TEXT PRIMARY KEY NOT NULL,
            value   INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO store_meta (key, value) VALUES ('epoch', 0);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| AffinityError::StoreUnavailable(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_once() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_epoch_seeded_at_zero() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let epoch: i64 = conn
            .query_row("SELECT value FROM store_meta WHERE key = 'epoch'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(epoch, 0);
    }

    #[test]
    fn test_embeddings_table_accepts_rows() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO embeddings (id, owner_id, embedding, embedding_type, created_at)
             VALUES ('r1', 'o1', '[0.1, 0.2]', 'bio', 1700000000000)",
            [],
        )
        .unwrap();

        let raw: String = conn
            .query_row("SELECT embedding FROM embeddings WHERE id = 'r1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(raw, "[0.1, 0.2]");
    }
}
