//! Versioned schema migrations for the local store
//!
//! Each migration runs in its own transaction and is recorded in the
//! `schema_version` table, so reopening a database applies only what is new.

use crate::types::Timestamp;
use rusqlite::{params, Connection};
use tracing::info;

pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Messages, peers and rooms",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    room_id TEXT NOT NULL,
                    sender TEXT NOT NULL,
                    recipient TEXT,
                    content TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    vector_clock TEXT NOT NULL,             -- JSON object
                    causality TEXT NOT NULL,                -- JSON array of ids
                    kind TEXT NOT NULL CHECK(kind IN ('text', 'file', 'system')),
                    status TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_messages_room_time ON messages(room_id, timestamp);

                CREATE TABLE IF NOT EXISTS peers (
                    peer_id TEXT PRIMARY KEY,
                    nickname TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    last_seen INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rooms (
                    room_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    is_private BOOLEAN NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                );
            "#,
        },
        Migration {
            version: 2,
            description: "Status lookup index",
            up_sql: r#"
                CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status)
                    WHERE status IN ('pending', 'failed');
            "#,
        },
    ]
}

fn current_version(conn: &Connection) -> Result<i32, rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current = current_version(conn)?;

    for migration in get_migrations().into_iter().filter(|m| m.version > current) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, Timestamp::now().as_millis() as i64],
        )?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied store migration"
        );
    }

    Ok(())
}

/// Latest migration version available
pub fn latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in ["messages", "peers", "rooms", "schema_version"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, get_migrations().len() as i64);
    }
}
