//! Schema migrations for the embedded document store.
//!
//! Each schema step is a static SQL batch with a version number.  Applied
//! versions are recorded in `_schema_versions`, so opening an existing file
//! only runs the steps it has not seen.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

struct Step {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new steps at the end.
static STEPS: &[Step] = &[
    Step {
        version: 1,
        description: "documents table",
        sql: r#"
            CREATE TABLE documents (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                database    TEXT NOT NULL,
                collection  TEXT NOT NULL,
                body        TEXT NOT NULL CHECK(json_valid(body)),
                created_at  INTEGER NOT NULL
            );
        "#,
    },
    Step {
        version: 2,
        description: "collection lookup index",
        sql: r#"
            CREATE INDEX idx_documents_collection ON documents(database, collection);
        "#,
    },
];

/// Bring `conn` up to the latest schema.  Blocking; run it off the runtime.
pub fn run_all(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _schema_versions (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| failed(0, "create _schema_versions", e))?;

    let current = current_version(conn)?;
    let pending: Vec<&Step> = STEPS.iter().filter(|s| s.version > current).collect();
    if pending.is_empty() {
        debug!(version = current, "document schema up to date");
        return Ok(());
    }

    for step in pending {
        apply(conn, step)?;
    }
    info!(version = latest_version(), "document schema migrated");
    Ok(())
}

/// Highest applied version, 0 on a fresh file.
pub fn current_version(conn: &Connection) -> StorageResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _schema_versions",
        [],
        |row| row.get(0),
    )
    .map_err(|e| failed(0, "read version", e))
}

pub fn latest_version() -> u32 {
    STEPS.last().map(|s| s.version).unwrap_or(0)
}

fn apply(conn: &Connection, step: &Step) -> StorageResult<()> {
    debug!(version = step.version, description = step.description, "applying schema step");

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| failed(step.version, "begin", e))?;

    let result = conn
        .execute_batch(step.sql)
        .map_err(|e| failed(step.version, "execute", e))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _schema_versions (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![step.version, step.description, chrono::Utc::now().timestamp()],
            )
            .map(|_| ())
            .map_err(|e| failed(step.version, "record", e))
        });

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT;")
            .map_err(|e| failed(step.version, "commit", e)),
        Err(err) => {
            warn!(version = step.version, %err, "schema step failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

fn failed(version: u32, stage: &str, err: rusqlite::Error) -> StorageError {
    StorageError::Migration {
        version,
        message: format!("{stage}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered() {
        for pair in STEPS.windows(2) {
            assert!(pair[1].version > pair[0].version);
        }
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn body_must_be_json() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let bad = conn.execute(
            "INSERT INTO documents (database, collection, body, created_at) VALUES ('d', 'c', 'nope', 0)",
            [],
        );
        assert!(bad.is_err());

        conn.execute(
            "INSERT INTO documents (database, collection, body, created_at) VALUES ('d', 'c', '{\"id\":\"A1\"}', 0)",
            [],
        )
        .unwrap();
    }
}
