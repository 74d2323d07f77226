//! Versioned schema migrations for SQLite.
//!
//! Migration `n` (1-based) is `MIGRATIONS[n - 1]`. Applied versions are
//! recorded in `schema_migrations`; each run applies what is missing in one
//! transaction.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{Result, StoreError};

/// The relational layout of stored CoValues.
const V1_INITIAL_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS coValues (
        rowID INTEGER PRIMARY KEY,
        id TEXT NOT NULL UNIQUE,
        header TEXT NOT NULL UNIQUE
    );

    -- lastIdx is the number of stored transactions
    CREATE TABLE IF NOT EXISTS sessions (
        rowID INTEGER PRIMARY KEY,
        coValue INTEGER NOT NULL,
        sessionID TEXT NOT NULL,
        lastIdx INTEGER,
        lastSignature TEXT,
        bytesSinceLastSignature INTEGER,
        UNIQUE (coValue, sessionID)
    );

    CREATE TABLE IF NOT EXISTS transactions (
        ses INTEGER,
        idx INTEGER,
        tx TEXT NOT NULL,
        PRIMARY KEY (ses, idx)
    ) WITHOUT ROWID;

    -- a checkpoint signature covers transactions 0..=idx
    CREATE TABLE IF NOT EXISTS signatureAfter (
        ses INTEGER,
        idx INTEGER,
        signature TEXT NOT NULL,
        PRIMARY KEY (ses, idx)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS sessionsByCoValue ON sessions (coValue);
"#;

const MIGRATIONS: &[&str] = &[V1_INITIAL_SCHEMA];

/// Schema version after all migrations.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;
    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{applied} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    let tx = conn.transaction()?;
    for (version, sql) in (1..).zip(MIGRATIONS).skip(applied as usize) {
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, now_millis()],
        )?;
        debug!(version, "applied schema migration");
    }
    tx.commit()?;
    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"coValues".to_string()));
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"transactions".to_string()));
        assert!(tables.contains(&"signatureAfter".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, 0)",
            params![CURRENT_VERSION + 1],
        )
        .unwrap();
        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap(); // Should not error
        migrate(&mut conn).unwrap(); // Still should not error

        // Verify version is 1
        let version: u32 = conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, 1);
    }
}
