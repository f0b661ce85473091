//! Archive intake: the boundary where uploaded bytes become a pending run.
//!
//! The archive is streamed to the uploads directory while its SHA-256 is
//! computed. An archive whose hash was ingested before is rejected with
//! [`IngestError::Conflict`] and leaves no records behind.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::run_repo::{self, RunCounters, RunRow};
use crate::db::{now_timestamp, Database, RetryPolicy};
use crate::error::{IngestError, LimitKind};
use crate::pipeline::stage::RunStage;
use crate::sanitize;

const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// An archive already on disk with a known content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArchive {
    pub run_id: String,
    pub path: PathBuf,
    pub original_filename: String,
    pub byte_size: u64,
    pub content_hash: String,
}

/// What [`Intake::accept`] hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSubmission {
    pub run_id: String,
    pub stored_path: PathBuf,
    pub original_filename: String,
    pub byte_size: u64,
    pub content_hash: String,
}

impl From<&RunRow> for ArchiveSubmission {
    fn from(run: &RunRow) -> Self {
        Self {
            run_id: run.id.clone(),
            stored_path: PathBuf::from(&run.archive_path),
            original_filename: run.original_filename.clone(),
            byte_size: run.byte_size,
            content_hash: run.content_hash.clone(),
        }
    }
}

/// Creates the pending run for a stored archive, refusing duplicate content.
pub fn register_run(
    db: &Database,
    retry: &RetryPolicy,
    archive: &StoredArchive,
) -> Result<RunRow, IngestError> {
    if let Some(existing) = retry.run("find_run_by_hash", || {
        run_repo::find_by_content_hash(db, &archive.content_hash)
    })? {
        return Err(IngestError::Conflict {
            content_hash: archive.content_hash.clone(),
            existing_run_id: existing.id,
        });
    }

    let now = now_timestamp();
    let run = RunRow {
        id: archive.run_id.clone(),
        original_filename: archive.original_filename.clone(),
        archive_path: archive.path.to_string_lossy().into_owned(),
        byte_size: archive.byte_size,
        content_hash: archive.content_hash.clone(),
        stage: RunStage::Pending,
        progress_percent: 0,
        error: None,
        counters: RunCounters::default(),
        created_at: now.clone(),
        updated_at: now,
        completed_at: None,
    };

    match retry.run("insert_run", || run_repo::insert(db, &run)) {
        Ok(()) => Ok(run),
        // Lost a race against a concurrent intake of the same bytes.
        Err(IngestError::Database(e)) if e.is_constraint_violation() => {
            let existing_run_id = run_repo::find_by_content_hash(db, &archive.content_hash)?
                .map(|r| r.id)
                .unwrap_or_default();
            Err(IngestError::Conflict {
                content_hash: archive.content_hash.clone(),
                existing_run_id,
            })
        }
        Err(e) => Err(e),
    }
}

/// Accepts uploaded archives into the uploads directory.
pub struct Intake {
    db: Database,
    retry: RetryPolicy,
    uploads_dir: PathBuf,
    max_archive_bytes: u64,
}

impl Intake {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            retry: RetryPolicy::from_config(&config.retry),
            uploads_dir: config.directories.uploads_dir.clone(),
            max_archive_bytes: config.limits.max_archive_bytes,
        }
    }

    /// Stores `reader` as a new archive and registers a pending run for it.
    pub fn accept(
        &self,
        reader: impl Read,
        original_filename: &str,
        declared_size: u64,
    ) -> Result<ArchiveSubmission, IngestError> {
        if declared_size > self.max_archive_bytes {
            return Err(IngestError::LimitExceeded {
                limit: LimitKind::ArchiveBytes,
                actual: declared_size,
                max: self.max_archive_bytes,
            });
        }
        if !original_filename.to_ascii_lowercase().ends_with(".zip") {
            return Err(IngestError::validation(format!(
                "Only .zip archives are accepted, got '{}'",
                sanitize::redact_path(Path::new(original_filename))
            )));
        }

        std::fs::create_dir_all(&self.uploads_dir)
            .map_err(|e| IngestError::io(&self.uploads_dir, e))?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let temp_path = self.uploads_dir.join(format!("{}.zip.tmp", run_id));
        let final_path = self.uploads_dir.join(format!("{}.zip", run_id));

        let (written, content_hash) = match self.stream_to(reader, &temp_path) {
            Ok(result) => result,
            Err(e) => {
                remove_quietly(&temp_path);
                return Err(e);
            }
        };

        if written != declared_size {
            remove_quietly(&temp_path);
            return Err(IngestError::validation(format!(
                "Archive size mismatch: declared {} bytes, received {}",
                declared_size, written
            )));
        }

        if let Some(existing) = self.retry.run("find_run_by_hash", || {
            run_repo::find_by_content_hash(&self.db, &content_hash)
        })? {
            remove_quietly(&temp_path);
            info!(existing_run_id = %existing.id, "Duplicate archive rejected");
            return Err(IngestError::Conflict {
                content_hash,
                existing_run_id: existing.id,
            });
        }

        std::fs::rename(&temp_path, &final_path).map_err(|e| {
            remove_quietly(&temp_path);
            IngestError::io(&final_path, e)
        })?;

        let archive = StoredArchive {
            run_id,
            path: final_path,
            original_filename: original_filename.to_string(),
            byte_size: written,
            content_hash,
        };
        let run = register_run(&self.db, &self.retry, &archive).inspect_err(|_| {
            remove_quietly(&archive.path);
        })?;

        info!(
            run_id = %run.id,
            file = %sanitize::redact_path(Path::new(original_filename)),
            bytes = run.byte_size,
            "Archive accepted"
        );

        Ok(ArchiveSubmission::from(&run))
    }

    /// Copies at most one byte past the archive limit, hashing as it goes.
    fn stream_to(&self, reader: impl Read, path: &Path) -> Result<(u64, String), IngestError> {
        let file = File::create(path).map_err(|e| IngestError::io(path, e))?;
        let mut out = BufWriter::new(file);
        let mut limited = reader.take(self.max_archive_bytes.saturating_add(1));
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_BYTES];
        let mut written: u64 = 0;

        loop {
            let n = match limited.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IngestError::io(path, e)),
            };
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .map_err(|e| IngestError::io(path, e))?;
            written += n as u64;
        }
        out.flush().map_err(|e| IngestError::io(path, e))?;

        if written > self.max_archive_bytes {
            return Err(IngestError::LimitExceeded {
                limit: LimitKind::ArchiveBytes,
                actual: written,
                max: self.max_archive_bytes,
            });
        }

        Ok((written, hex::encode(hasher.finalize())))
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(file = %sanitize::redact_path(path), "Failed to remove upload: {}", e);
        }
    }
}
