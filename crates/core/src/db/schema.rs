//! Destination schema and migration runner.
//!
//! Migrations are plain SQL applied in order; the SQLite `user_version`
//! pragma records the last one applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;
use crate::models::EntryKind;

/// `(version, description, sql)`, versions starting at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "users, groups and state",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            syncid      TEXT UNIQUE,
            name        TEXT    NOT NULL DEFAULT '',
            enabled     INTEGER NOT NULL DEFAULT 1,
            attributes  TEXT    NOT NULL DEFAULT '{}',
            updated_at  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS groups (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            syncid      TEXT UNIQUE,
            name        TEXT    NOT NULL DEFAULT '',
            enabled     INTEGER NOT NULL DEFAULT 1,
            attributes  TEXT    NOT NULL DEFAULT '{}',
            updated_at  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "name indexes for guess matching",
        r#"
        CREATE INDEX IF NOT EXISTS idx_users_name ON users (name);
        CREATE INDEX IF NOT EXISTS idx_groups_name ON groups (name);
        "#,
    ),
];

/// Table holding rows of `kind`.
pub fn table(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::User => "users",
        EntryKind::Group => "groups",
    }
}

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version <= current_version {
            continue;
        }
        info!(version, description, "applying migration");
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::MigrationFailed {
                version,
                detail: e.to_string(),
            })?;
        conn.pragma_update(None, "user_version", version)?;
        debug!(version, "migration applied");
    }

    Ok(())
}

/// Current `user_version`.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for kind in EntryKind::ALL {
            assert!(tables.contains(&table(kind).to_string()));
        }
        assert!(tables.contains(&"kv_state".to_string()));
    }

    #[test]
    fn test_syncid_unique_per_table() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO users (syncid, updated_at) VALUES ('x', '2024-01-01T00:00:00Z')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
        // Unmatched rows may coexist.
        conn.execute("INSERT INTO users (updated_at) VALUES ('t')", []).unwrap();
        conn.execute("INSERT INTO users (updated_at) VALUES ('t')", []).unwrap();
    }
}
