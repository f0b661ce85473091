//! Extracted file repository: what the extractor wrote for a run, and how far parsing got.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, Row};
use thiserror::Error;

use crate::extract::classify::FileKind;

use super::{text_enum, Database, DatabaseError};

/// Processing state of one extracted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Extracted,
    Parsed,
    Failed,
}

#[derive(Error, Debug)]
#[error("Unknown file status '{0}'")]
pub struct UnknownFileStatus(pub String);

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Extracted => "extracted",
            FileStatus::Parsed => "parsed",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = UnknownFileStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extracted" => Ok(FileStatus::Extracted),
            "parsed" => Ok(FileStatus::Parsed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(UnknownFileStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFileRow {
    pub id: String,
    pub run_id: String,
    /// Relative to the run's quarantine directory, `/`-separated.
    pub relative_path: String,
    pub byte_size: u64,
    pub kind: FileKind,
    pub status: FileStatus,
    pub error: Option<String>,
    pub created_at: String,
}

impl ExtractedFileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            relative_path: row.get("relative_path")?,
            byte_size: row.get("byte_size")?,
            kind: text_enum(row, "kind")?,
            status: text_enum(row, "status")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a batch of rows on an open transaction.
pub fn insert_all(conn: &Connection, rows: &[ExtractedFileRow]) -> Result<(), DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO extracted_files (id, run_id, relative_path, byte_size, kind, status, error,
         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.id,
            row.run_id,
            row.relative_path,
            row.byte_size,
            row.kind.as_str(),
            row.status.as_str(),
            row.error,
            row.created_at,
        ])?;
    }
    Ok(())
}

pub fn list_by_run(db: &Database, run_id: &str) -> Result<Vec<ExtractedFileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM extracted_files WHERE run_id = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt
            .query_map(params![run_id], ExtractedFileRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Candidate export files of a run that still have to be parsed, in path order.
pub fn list_pending_candidates(
    db: &Database,
    run_id: &str,
) -> Result<Vec<ExtractedFileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM extracted_files
             WHERE run_id = ?1 AND kind = ?2 AND status = ?3
             ORDER BY relative_path",
        )?;
        let rows = stmt
            .query_map(
                params![
                    run_id,
                    FileKind::CandidateExport.as_str(),
                    FileStatus::Extracted.as_str()
                ],
                ExtractedFileRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_by_run(db: &Database, run_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM extracted_files WHERE run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

pub fn mark_status(
    db: &Database,
    id: &str,
    status: FileStatus,
    error: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE extracted_files SET status = ?2, error = ?3 WHERE id = ?1",
            params![id, status.as_str(), error],
        )?;
        Ok(())
    })
}

/// Removes every row of a run. Used before re-extracting an interrupted run.
pub fn delete_by_run(db: &Database, run_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM extracted_files WHERE run_id = ?1",
            params![run_id],
        )?;
        Ok(deleted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;

    fn file(run_id: &str, path: &str, kind: FileKind) -> ExtractedFileRow {
        ExtractedFileRow {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            relative_path: path.to_string(),
            byte_size: 10,
            kind,
            status: FileStatus::Extracted,
            error: None,
            created_at: "2024-01-15T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_insert_and_list() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");

        let rows = vec![
            file("run-1", "media/b.png", FileKind::Auxiliary),
            file("run-1", "conversations.json", FileKind::CandidateExport),
        ];
        db.with_tx(|conn| insert_all(conn, &rows)).unwrap();

        let listed = list_by_run(&db, "run-1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].relative_path, "conversations.json");
        assert_eq!(listed[1].kind, FileKind::Auxiliary);
        assert_eq!(count_by_run(&db, "run-1").unwrap(), 2);
    }

    #[test]
    fn test_pending_candidates_excludes_parsed_and_other_kinds() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");

        let a = file("run-1", "a/conversations.json", FileKind::CandidateExport);
        let b = file("run-1", "b/conversations.json", FileKind::CandidateExport);
        let c = file("run-1", "notes.txt", FileKind::Unknown);
        db.with_tx(|conn| insert_all(conn, &[a.clone(), b.clone(), c.clone()]))
            .unwrap();

        mark_status(&db, &a.id, FileStatus::Parsed, None).unwrap();

        let pending = list_pending_candidates(&db, "run-1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[test]
    fn test_mark_failed_records_error() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let a = file("run-1", "conversations.json", FileKind::CandidateExport);
        db.with_tx(|conn| insert_all(conn, std::slice::from_ref(&a)))
            .unwrap();

        mark_status(&db, &a.id, FileStatus::Failed, Some("bad json")).unwrap();
        let listed = list_by_run(&db, "run-1").unwrap();
        assert_eq!(listed[0].status, FileStatus::Failed);
        assert_eq!(listed[0].error.as_deref(), Some("bad json"));
    }

    #[test]
    fn test_delete_by_run() {
        let db = Database::open_in_memory().unwrap();
        test_support::insert_run(&db, "run-1");
        let rows = vec![file("run-1", "x.json", FileKind::Unknown)];
        db.with_tx(|conn| insert_all(conn, &rows)).unwrap();

        assert_eq!(delete_by_run(&db, "run-1").unwrap(), 1);
        assert!(list_by_run(&db, "run-1").unwrap().is_empty());
    }
}
