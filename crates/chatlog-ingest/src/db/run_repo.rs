//! Run repository: one row per ingested archive.

use rusqlite::{params, OptionalExtension, Row};

use crate::pipeline::stage::RunStage;

use super::{text_enum, Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRow {
    pub id: String,
    pub original_filename: String,
    pub archive_path: String,
    pub byte_size: u64,
    pub content_hash: String,
    pub stage: RunStage,
    pub progress_percent: u8,
    pub error: Option<String>,
    pub counters: RunCounters,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Summary counters shown to callers once a run settles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub files_extracted: u64,
    pub conversations_found: u64,
    pub messages_found: u64,
    pub threads_found: u64,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            original_filename: row.get("original_filename")?,
            archive_path: row.get("archive_path")?,
            byte_size: row.get("byte_size")?,
            content_hash: row.get("content_hash")?,
            stage: text_enum(row, "stage")?,
            progress_percent: row.get("progress_percent")?,
            error: row.get("error")?,
            counters: RunCounters {
                files_extracted: row.get("files_extracted")?,
                conversations_found: row.get("conversations_found")?,
                messages_found: row.get("messages_found")?,
                threads_found: row.get("threads_found")?,
            },
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Inserts a new run row.
pub fn insert(db: &Database, run: &RunRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO runs (id, original_filename, archive_path, byte_size, content_hash,
             stage, progress_percent, error, files_extracted, conversations_found,
             messages_found, threads_found, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run.id,
                run.original_filename,
                run.archive_path,
                run.byte_size,
                run.content_hash,
                run.stage.as_str(),
                run.progress_percent,
                run.error,
                run.counters.files_extracted,
                run.counters.conversations_found,
                run.counters.messages_found,
                run.counters.threads_found,
                run.created_at,
                run.updated_at,
                run.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a run by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM runs WHERE id = ?1",
                params![id],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds the run that already ingested an archive with this content hash.
pub fn find_by_content_hash(db: &Database, hash: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM runs WHERE content_hash = ?1",
                params![hash],
                RunRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Runs that have not reached a terminal stage, oldest first.
pub fn list_unfinished(db: &Database) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM runs WHERE stage NOT IN ('completed', 'failed') ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Sets the stage. A terminal stage also stamps `completed_at`; `error` is overwritten.
pub fn update_stage(
    db: &Database,
    id: &str,
    stage: RunStage,
    error: Option<&str>,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    let completed_at = stage.is_terminal().then_some(updated_at);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE runs SET stage = ?2, error = ?3, updated_at = ?4,
             completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1",
            params![id, stage.as_str(), error, updated_at, completed_at],
        )?;
        Ok(())
    })
}

/// Raises the stored progress. Lower values are ignored, so progress never moves backwards.
///
/// Returns whether the row changed.
pub fn raise_progress(
    db: &Database,
    id: &str,
    percent: u8,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE runs SET progress_percent = ?2, updated_at = ?3
             WHERE id = ?1 AND progress_percent < ?2",
            params![id, percent.min(100), updated_at],
        )?;
        Ok(changed > 0)
    })
}

pub fn update_counters(
    db: &Database,
    id: &str,
    counters: &RunCounters,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE runs SET files_extracted = ?2, conversations_found = ?3,
             messages_found = ?4, threads_found = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                counters.files_extracted,
                counters.conversations_found,
                counters.messages_found,
                counters.threads_found,
                updated_at,
            ],
        )?;
        Ok(())
    })
}
