//! Conversation repository.
//!
//! A conversation is unique per (run, external id). `imported` flips to true only
//! after every message batch committed, so a half-written conversation can be
//! told apart from a finished one when a run resumes.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: String,
    pub run_id: String,
    pub external_id: String,
    pub title: String,
    pub declared_created_at: Option<String>,
    pub declared_updated_at: Option<String>,
    pub source_file: String,
    pub message_count: u64,
    pub imported: bool,
    pub created_at: String,
}

impl ConversationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            external_id: row.get("external_id")?,
            title: row.get("title")?,
            declared_created_at: row.get("declared_created_at")?,
            declared_updated_at: row.get("declared_updated_at")?,
            source_file: row.get("source_file")?,
            message_count: row.get("message_count")?,
            imported: row.get("imported")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(db: &Database, conversation: &ConversationRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO conversations (id, run_id, external_id, title, declared_created_at,
             declared_updated_at, source_file, message_count, imported, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                conversation.id,
                conversation.run_id,
                conversation.external_id,
                conversation.title,
                conversation.declared_created_at,
                conversation.declared_updated_at,
                conversation.source_file,
                conversation.message_count,
                conversation.imported,
                conversation.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ConversationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM conversations WHERE id = ?1",
                params![id],
                ConversationRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn find_by_external_id(
    db: &Database,
    run_id: &str,
    external_id: &str,
) -> Result<Option<ConversationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM conversations WHERE run_id = ?1 AND external_id = ?2",
                params![run_id, external_id],
                ConversationRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list_by_run(db: &Database, run_id: &str) -> Result<Vec<ConversationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations WHERE run_id = ?1 ORDER BY created_at, external_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], ConversationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Records the final message count and marks the conversation complete.
pub fn mark_imported(db: &Database, id: &str, message_count: u64) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE conversations SET message_count = ?2, imported = 1 WHERE id = ?1",
            params![id, message_count],
        )?;
        Ok(())
    })
}

pub fn count_imported_by_run(db: &Database, run_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE run_id = ?1 AND imported = 1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;

    #[test]
    fn test_insert_and_find_by_external_id() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let conv = test_support::insert_conversation(&db, "run-1", "ext-a");

        let found = find_by_external_id(&db, "run-1", "ext-a").unwrap().unwrap();
        assert_eq!(found, conv);
        assert!(!found.imported);
        assert!(find_by_external_id(&db, "run-2", "ext-a").unwrap().is_none());
        assert_eq!(find_by_id(&db, &conv.id).unwrap().unwrap().external_id, "ext-a");
    }

    #[test]
    fn test_external_id_unique_per_run() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let conv = test_support::insert_conversation(&db, "run-1", "ext-a");

        let mut dup = conv.clone();
        dup.id = "other".to_string();
        let err = insert(&db, &dup).unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_mark_imported_and_count() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let a = test_support::insert_conversation(&db, "run-1", "a");
        test_support::insert_conversation(&db, "run-1", "b");

        assert_eq!(count_imported_by_run(&db, "run-1").unwrap(), 0);
        mark_imported(&db, &a.id, 5).unwrap();
        assert_eq!(count_imported_by_run(&db, "run-1").unwrap(), 1);

        let found = find_by_id(&db, &a.id).unwrap().unwrap();
        assert!(found.imported);
        assert_eq!(found.message_count, 5);
        assert_eq!(list_by_run(&db, "run-1").unwrap().len(), 2);
    }
}
