//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use vg_core::{Error, Result};

/// V1: the video record table.
const V1_VIDEOS: &str = r#"
CREATE TABLE videos (
    id                 TEXT PRIMARY KEY,
    owner_id           TEXT NOT NULL,
    organization       TEXT,
    title              TEXT NOT NULL,
    description        TEXT,
    tags               TEXT NOT NULL DEFAULT '[]',
    original_filename  TEXT NOT NULL,
    blob_handle        TEXT NOT NULL,
    byte_size          INTEGER NOT NULL,
    mime_type          TEXT NOT NULL,
    duration_secs      REAL,
    width              INTEGER,
    height             INTEGER,
    codec              TEXT,
    bitrate            INTEGER,
    has_audio          INTEGER,
    thumbnail_handle   TEXT,
    state              TEXT NOT NULL DEFAULT 'uploading',
    progress           INTEGER NOT NULL DEFAULT 0,
    error_message      TEXT,
    verdict            TEXT NOT NULL DEFAULT 'pending',
    verdict_overridden INTEGER NOT NULL DEFAULT 0,
    is_public          INTEGER NOT NULL DEFAULT 0,
    deleted            INTEGER NOT NULL DEFAULT 0,
    deleted_at         TEXT,
    version            INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    CHECK (progress BETWEEN 0 AND 100)
);

CREATE INDEX idx_videos_owner ON videos(owner_id);
"#;

/// V2: index backing the startup stale-record sweep.
const V2_STALE_SWEEP: &str = r#"
CREATE INDEX idx_videos_state_updated ON videos(state, updated_at);
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_VIDEOS), (2, V2_STALE_SWEEP)];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        // second call is a no-op
        run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn progress_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO videos (id, owner_id, title, original_filename, blob_handle,
                byte_size, mime_type, progress, created_at, updated_at)
             VALUES ('a', 'b', 't', 'f.mp4', 'videos/x.mp4', 1, 'video/mp4', 101, 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
