//! Message repository.

use rusqlite::{params, Connection, Row};

use crate::export::model::Role;

use super::{text_enum, Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    /// Node id from the export.
    pub external_id: String,
    pub role: Role,
    pub content: String,
    /// UTC, see [`super::format_timestamp`].
    pub timestamp: String,
    /// Set when the export carried no usable time and the processing instant was used.
    pub timestamp_estimated: bool,
    pub sequence_index: u64,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            conversation_id: row.get("conversation_id")?,
            external_id: row.get("external_id")?,
            role: text_enum(row, "role")?,
            content: row.get("content")?,
            timestamp: row.get("timestamp")?,
            timestamp_estimated: row.get("timestamp_estimated")?,
            sequence_index: row.get("sequence_index")?,
        })
    }
}

/// Inserts a batch of rows on an open transaction.
pub fn insert_all(conn: &Connection, rows: &[MessageRow]) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO messages (id, conversation_id, external_id, role, content, timestamp,
         timestamp_estimated, sequence_index)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.id,
            row.conversation_id,
            row.external_id,
            row.role.as_str(),
            row.content,
            row.timestamp,
            row.timestamp_estimated,
            row.sequence_index,
        ])?;
    }
    Ok(())
}

/// All messages of a conversation in sequence order.
pub fn list_by_conversation(
    db: &Database,
    conversation_id: &str,
) -> Result<Vec<MessageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY sequence_index",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], MessageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Messages whose UTC timestamp falls on `date` (`YYYY-MM-DD`), chronologically.
pub fn list_by_date(db: &Database, date: &str) -> Result<Vec<MessageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE substr(timestamp, 1, 10) = ?1
             ORDER BY timestamp, conversation_id, sequence_index",
        )?;
        let rows = stmt
            .query_map(params![date], MessageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_by_conversation(db: &Database, conversation_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

pub fn count_by_run(db: &Database, run_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Drops the partial output of an interrupted conversation import.
pub fn delete_by_conversation(db: &Database, conversation_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM threads WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(deleted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;

    #[test]
    fn test_insert_and_list_in_sequence_order() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let conv = test_support::insert_conversation(&db, "run-1", "a");

        let rows = vec![
            test_support::message(&conv.id, 1, "2024-01-15T10:00:00.000Z"),
            test_support::message(&conv.id, 0, "2024-01-15T09:00:00.000Z"),
        ];
        db.with_tx(|conn| insert_all(conn, &rows)).unwrap();

        let listed = list_by_conversation(&db, &conv.id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].sequence_index, 0);
        assert_eq!(listed[1].sequence_index, 1);
        assert_eq!(count_by_conversation(&db, &conv.id).unwrap(), 2);
        assert_eq!(count_by_run(&db, "run-1").unwrap(), 2);
    }

    #[test]
    fn test_sequence_index_unique_per_conversation() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let conv = test_support::insert_conversation(&db, "run-1", "a");

        let rows = vec![
            test_support::message(&conv.id, 0, "2024-01-15T09:00:00.000Z"),
            test_support::message(&conv.id, 0, "2024-01-15T10:00:00.000Z"),
        ];
        let err = db.with_tx(|conn| insert_all(conn, &rows)).unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(count_by_conversation(&db, &conv.id).unwrap(), 0);
    }

    #[test]
    fn test_list_by_date() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let conv = test_support::insert_conversation(&db, "run-1", "a");
        let rows = vec![
            test_support::message(&conv.id, 0, "2024-01-15T23:59:59.999Z"),
            test_support::message(&conv.id, 1, "2024-01-16T00:00:00.000Z"),
        ];
        db.with_tx(|conn| insert_all(conn, &rows)).unwrap();

        let on_15th = list_by_date(&db, "2024-01-15").unwrap();
        assert_eq!(on_15th.len(), 1);
        assert_eq!(on_15th[0].sequence_index, 0);
        assert_eq!(list_by_date(&db, "2024-01-16").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_by_conversation() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let conv = test_support::insert_conversation(&db, "run-1", "a");
        let rows = vec![test_support::message(&conv.id, 0, "2024-01-15T09:00:00.000Z")];
        db.with_tx(|conn| insert_all(conn, &rows)).unwrap();

        assert_eq!(delete_by_conversation(&db, &conv.id).unwrap(), 1);
        assert_eq!(count_by_conversation(&db, &conv.id).unwrap(), 0);
    }
}
