//! Store migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table.

use crate::StoreResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Store schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running store migrations");

    if current_version < 1 {
        migrate_v1_backup_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_stored_at_index(conn)?;
    }

    info!("Store migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: backup rows with the recovery-order index.
fn migrate_v1_backup_events(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS backup_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            priority_class TEXT NOT NULL,
            stored_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_backup_events_class_stored_at
            ON backup_events(priority_class, stored_at);
        ",
    )?;
    record_migration(conn, 1, "backup_events")
}

/// V2: index for the retention sweep, which scans by age across classes.
fn migrate_v2_stored_at_index(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_backup_events_stored_at ON backup_events(stored_at);",
    )?;
    record_migration(conn, 2, "stored_at_index")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, CURRENT_VERSION as i64);
    }

    #[test]
    fn test_recovery_index_exists() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_backup_events_class_stored_at'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
