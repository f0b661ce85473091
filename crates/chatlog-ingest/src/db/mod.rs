//! Persistent storage for runs and everything a run produces.
//!
//! Uses rusqlite (SQLite) with an explicit, cloneable `Database` handle.
//! All access is serialized through a `Mutex<Connection>`; SQLite is a
//! single-writer store, so every write path goes through [`retry::RetryPolicy`].

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

pub mod batch;
pub mod conversation_repo;
pub mod error;
pub mod extracted_file_repo;
pub mod message_repo;
pub mod migrations;
pub mod retry;
pub mod run_repo;
pub mod thread_repo;

pub use error::DatabaseError;
pub use retry::RetryPolicy;

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). Every component receives its handle at
/// construction, so independent runs and tests can use independent databases.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside one transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Storage form of an instant: RFC 3339, UTC, millisecond precision.
///
/// Fixed width, so lexical order equals chronological order and the first ten
/// characters are the UTC calendar date.
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Reads a TEXT column into a closed enum via `FromStr`.
pub(crate) fn text_enum<T>(row: &Row<'_>, column: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(column)?;
    raw.parse::<T>().map_err(|e| {
        let index = row.as_ref().column_index(column).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Row fixtures shared by the repository tests.

    use super::conversation_repo::{self, ConversationRow};
    use super::message_repo::MessageRow;
    use super::run_repo::{self, RunCounters, RunRow};
    use super::Database;
    use crate::export::model::Role;
    use crate::pipeline::stage::RunStage;

    pub fn insert_run(db: &Database, id: &str) -> RunRow {
        let run = RunRow {
            id: id.to_string(),
            original_filename: "export.zip".to_string(),
            archive_path: format!("/tmp/{}.zip", id),
            byte_size: 1,
            content_hash: format!("hash-{}", id),
            stage: RunStage::Pending,
            progress_percent: 0,
            error: None,
            counters: RunCounters::default(),
            created_at: "2024-01-15T00:00:00.000Z".to_string(),
            updated_at: "2024-01-15T00:00:00.000Z".to_string(),
            completed_at: None,
        };
        run_repo::insert(db, &run).unwrap();
        run
    }

    pub fn insert_conversation(db: &Database, run_id: &str, external_id: &str) -> ConversationRow {
        let conversation = ConversationRow {
            id: format!("{}-{}", run_id, external_id),
            run_id: run_id.to_string(),
            external_id: external_id.to_string(),
            title: format!("Conversation {}", external_id),
            declared_created_at: None,
            declared_updated_at: None,
            source_file: "conversations.json".to_string(),
            message_count: 0,
            imported: false,
            created_at: "2024-01-15T00:00:00.000Z".to_string(),
        };
        conversation_repo::insert(db, &conversation).unwrap();
        conversation
    }

    pub fn message(conversation_id: &str, sequence_index: u64, timestamp: &str) -> MessageRow {
        MessageRow {
            id: format!("{}-m{}-{}", conversation_id, sequence_index, timestamp),
            conversation_id: conversation_id.to_string(),
            external_id: format!("node-{}", sequence_index),
            role: Role::User,
            content: format!("message {}", sequence_index),
            timestamp: timestamp.to_string(),
            timestamp_estimated: false,
            sequence_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_file_db_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chatlog.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
            assert_eq!(mode.to_lowercase(), "wal");
            Ok(())
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DatabaseError> = db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO runs (id, original_filename, archive_path, byte_size, content_hash,
                 created_at, updated_at) VALUES ('r1', 'a.zip', '/tmp/a.zip', 1, 'h1', 'now', 'now')",
                [],
            )?;
            Err(DatabaseError::LockPoisoned)
        });
        assert!(result.is_err());

        let count: u32 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_timestamp_format_is_sortable_utc() {
        let instant = DateTime::parse_from_rfc3339("2024-01-15T23:30:00+02:00")
            .unwrap()
            .with_timezone(&Utc);
        let text = format_timestamp(&instant);
        assert_eq!(text, "2024-01-15T21:30:00.000Z");
        assert_eq!(parse_timestamp(&text), Some(instant));
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_database_is_clone() {
        let db = Database::open_in_memory().unwrap();
        let db2 = db.clone();
        db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO runs (id, original_filename, archive_path, byte_size, content_hash,
                 created_at, updated_at) VALUES ('r1', 'a.zip', '/tmp/a.zip', 1, 'h1', 'now', 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db2.with_conn(|conn| {
            let count: u32 = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }
}
