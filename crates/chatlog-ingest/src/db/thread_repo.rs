//! Thread repository: one row per (conversation, UTC date).

use std::collections::BTreeSet;

use rusqlite::{params, Connection, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRow {
    pub id: String,
    pub conversation_id: String,
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub message_count: u64,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub start_message_id: String,
    pub end_message_id: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub created_at: String,
}

impl ThreadRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            date: row.get("date")?,
            message_count: row.get("message_count")?,
            start_sequence: row.get("start_sequence")?,
            end_sequence: row.get("end_sequence")?,
            start_message_id: row.get("start_message_id")?,
            end_message_id: row.get("end_message_id")?,
            start_timestamp: row.get("start_timestamp")?,
            end_timestamp: row.get("end_timestamp")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a batch of rows on an open transaction.
///
/// A row whose (conversation, date) already exists is left alone. Returns the
/// number of rows actually inserted.
pub fn insert_all(conn: &Connection, rows: &[ThreadRow]) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO threads (id, conversation_id, date, message_count, start_sequence,
         end_sequence, start_message_id, end_message_id, start_timestamp, end_timestamp,
         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (conversation_id, date) DO NOTHING",
    )?;
    let mut inserted = 0;
    for row in rows {
        inserted += stmt.execute(params![
            row.id,
            row.conversation_id,
            row.date,
            row.message_count,
            row.start_sequence,
            row.end_sequence,
            row.start_message_id,
            row.end_message_id,
            row.start_timestamp,
            row.end_timestamp,
            row.created_at,
        ])?;
    }
    Ok(inserted)
}

/// Dates that already have a thread for this conversation.
pub fn existing_dates(
    db: &Database,
    conversation_id: &str,
) -> Result<BTreeSet<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT date FROM threads WHERE conversation_id = ?1")?;
        let dates = stmt
            .query_map(params![conversation_id], |r| r.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(dates)
    })
}

pub fn list_by_conversation(
    db: &Database,
    conversation_id: &str,
) -> Result<Vec<ThreadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM threads WHERE conversation_id = ?1 ORDER BY date")?;
        let rows = stmt
            .query_map(params![conversation_id], ThreadRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn list_by_date(db: &Database, date: &str) -> Result<Vec<ThreadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM threads WHERE date = ?1 ORDER BY start_timestamp, conversation_id",
        )?;
        let rows = stmt
            .query_map(params![date], ThreadRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Every date that has at least one thread, ascending.
pub fn list_dates(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT DISTINCT date FROM threads ORDER BY date")?;
        let dates = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dates)
    })
}

pub fn count_by_run(db: &Database, run_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM threads t
             JOIN conversations c ON c.id = t.conversation_id
             WHERE c.run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
