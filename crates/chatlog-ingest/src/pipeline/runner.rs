use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, info_span, warn};

use crate::config::Config;
use crate::db::batch::write_in_batches;
use crate::db::extracted_file_repo::{self, ExtractedFileRow, FileStatus};
use crate::db::run_repo::{self, RunCounters, RunRow};
use crate::db::{conversation_repo, message_repo, now_timestamp, thread_repo, Database, RetryPolicy};
use crate::error::IngestError;
use crate::export::ExportParser;
use crate::extract::{ArchiveExtractor, ExtractionLimits};
use crate::intake::{self, StoredArchive};
use crate::sanitize;
use crate::segment::ThreadSegmenter;
use crate::worker::CancellationToken;

use super::progress::{NoopProgress, ProgressEvent, ProgressReporter, ProgressTracker};
use super::stage::RunStage;

/// Drives ingestion runs through their stages.
///
/// One coordinator can serve many runs concurrently; the state of a run lives
/// in storage and in the call frame of [`PipelineCoordinator::run`].
pub struct PipelineCoordinator {
    config: Arc<Config>,
    db: Database,
    retry: RetryPolicy,
    extractor: ArchiveExtractor,
    parser: ExportParser,
    segmenter: ThreadSegmenter,
    reporter: Arc<dyn ProgressReporter>,
}

impl PipelineCoordinator {
    pub fn new(config: Arc<Config>, db: Database) -> Self {
        Self::with_reporter(config, db, Arc::new(NoopProgress))
    }

    pub fn with_reporter(
        config: Arc<Config>,
        db: Database,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let extractor = ArchiveExtractor::new(ExtractionLimits::from(&config.limits));
        let parser = ExportParser::from_config(db.clone(), &config);
        let segmenter = ThreadSegmenter::from_config(db.clone(), &config);
        Self {
            config,
            db,
            retry,
            extractor,
            parser,
            segmenter,
            reporter,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Registers an archive that is already stored and hashed.
    pub fn register(&self, archive: &StoredArchive) -> Result<RunRow, IngestError> {
        intake::register_run(&self.db, &self.retry, archive)
    }

    pub fn find_run(&self, run_id: &str) -> Result<RunRow, IngestError> {
        run_repo::find_by_id(&self.db, run_id)?.ok_or_else(|| IngestError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })
    }

    /// Quarantine directory a run extracts into.
    pub fn quarantine_dir(&self, run_id: &str) -> PathBuf {
        self.config.directories.extracted_dir.join(run_id)
    }

    /// Executes every remaining stage of a run.
    ///
    /// A run found mid-way resumes at its stored stage. Terminal runs are
    /// returned unchanged. A fatal error marks the run failed with its cause and
    /// is returned; work committed before the failure is kept.
    pub fn run(&self, run_id: &str, cancel: &CancellationToken) -> Result<RunRow, IngestError> {
        let mut run = self.find_run(run_id)?;
        if run.stage.is_terminal() {
            return Ok(run);
        }

        let _run_span = info_span!("run",
            run_id = %run.id,
            archive = %sanitize::redact_path(Path::new(&run.original_filename)),
        )
        .entered();
        info!(stage = %run.stage, progress = run.progress_percent, "Starting run");

        let mut tracker = ProgressTracker::new(
            &self.db,
            &self.retry,
            &run_id[..],
            run.progress_percent,
            &*self.reporter,
        );

        match self.drive(&mut run, cancel, &mut tracker) {
            Ok(()) => {
                let run = self.find_run(run_id)?;
                info!(
                    files = run.counters.files_extracted,
                    conversations = run.counters.conversations_found,
                    messages = run.counters.messages_found,
                    threads = run.counters.threads_found,
                    "Run completed"
                );
                self.reporter.report(ProgressEvent::Completed {
                    run_id: run.id.clone(),
                    counters: run.counters,
                });
                Ok(run)
            }
            Err(e) => {
                let percent = tracker.percent();
                self.record_failure(&mut run, &e);
                self.reporter.report(ProgressEvent::Failed {
                    run_id: run.id.clone(),
                    percent,
                    error: e.failure_cause(),
                });
                Err(e)
            }
        }
    }

    fn drive(
        &self,
        run: &mut RunRow,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<(), IngestError> {
        loop {
            if run.stage.is_terminal() {
                return Ok(());
            }
            cancel.check()?;
            match run.stage {
                RunStage::Pending => {}
                RunStage::Extracting => {
                    let _stage = info_span!("extract").entered();
                    self.extract_stage(run, cancel, tracker)?;
                }
                RunStage::Parsing => {
                    let _stage = info_span!("parse").entered();
                    self.parse_stage(run, cancel, tracker)?;
                }
                RunStage::Importing => {
                    let _stage = info_span!("segment").entered();
                    self.segment_stage(run, cancel, tracker)?;
                }
                RunStage::Completed | RunStage::Failed => return Ok(()),
            }

            let Some(next) = run.stage.next() else {
                return Ok(());
            };
            self.set_stage(run, next, None)?;
            tracker.enter(next)?;
        }
    }

    fn extract_stage(
        &self,
        run: &mut RunRow,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<(), IngestError> {
        let archive = PathBuf::from(&run.archive_path);
        let destination = self.quarantine_dir(&run.id);

        let cleared = self.retry.run("clear_extracted_files", || {
            extracted_file_repo::delete_by_run(&self.db, &run.id)
        })?;
        if cleared > 0 {
            info!(cleared, "Re-extracting interrupted run");
        }

        let mut progress_error = None;
        let report = self.extractor.extract(&archive, &destination, cancel, &mut |done, total| {
            if progress_error.is_none() {
                if let Err(e) = tracker.advance(RunStage::Extracting, done, total, "Extracting archive") {
                    progress_error = Some(e);
                }
            }
        })?;
        if let Some(e) = progress_error {
            return Err(e);
        }

        if !report.skipped.is_empty() {
            warn!(skipped = report.skipped.len(), "Archive entries were skipped");
        }

        let created_at = now_timestamp();
        let rows: Vec<ExtractedFileRow> = report
            .files
            .iter()
            .map(|file| ExtractedFileRow {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                relative_path: file.relative_path.clone(),
                byte_size: file.byte_size,
                kind: file.kind,
                status: FileStatus::Extracted,
                error: None,
                created_at: created_at.clone(),
            })
            .collect();
        write_in_batches(
            &self.db,
            &self.retry,
            &rows,
            self.config.batching.record_batch_size,
            cancel,
            extracted_file_repo::insert_all,
        )?;

        run.counters.files_extracted = rows.len() as u64;
        self.save_counters(run)?;
        info!(
            files = rows.len(),
            candidates = report.candidates().count(),
            bytes = report.total_bytes,
            "Extraction finished"
        );
        Ok(())
    }

    fn parse_stage(
        &self,
        run: &mut RunRow,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<(), IngestError> {
        let candidates = self.retry.run("list_candidates", || {
            extracted_file_repo::list_pending_candidates(&self.db, &run.id)
        })?;
        if candidates.is_empty() {
            warn!("No candidate export files left to parse");
        }

        let root = self.quarantine_dir(&run.id);
        let total = candidates.len() as u64;
        for (index, file) in candidates.iter().enumerate() {
            cancel.check()?;
            let path = root.join(&file.relative_path);

            match self.parser.parse_file(&run.id, &path, &file.relative_path, cancel) {
                Ok(_) => {
                    self.retry.run("mark_file_parsed", || {
                        extracted_file_repo::mark_status(&self.db, &file.id, FileStatus::Parsed, None)
                    })?;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(file = %sanitize::redact_path(&path), "Export file failed to parse: {}", e);
                    let message = e.to_string();
                    self.retry.run("mark_file_failed", || {
                        extracted_file_repo::mark_status(
                            &self.db,
                            &file.id,
                            FileStatus::Failed,
                            Some(message.as_str()),
                        )
                    })?;
                }
                Err(e) => return Err(e),
            }

            tracker.advance(RunStage::Parsing, index as u64 + 1, total, "Parsing export files")?;
        }

        run.counters.conversations_found = conversation_repo::count_imported_by_run(&self.db, &run.id)?;
        run.counters.messages_found = message_repo::count_by_run(&self.db, &run.id)?;
        self.save_counters(run)?;
        info!(
            conversations = run.counters.conversations_found,
            messages = run.counters.messages_found,
            "Parsing finished"
        );
        Ok(())
    }

    fn segment_stage(
        &self,
        run: &mut RunRow,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<(), IngestError> {
        let conversations: Vec<_> = self
            .retry
            .run("list_conversations", || {
                conversation_repo::list_by_run(&self.db, &run.id)
            })?
            .into_iter()
            .filter(|c| c.imported)
            .collect();

        let total = conversations.len() as u64;
        let mut failed_buckets = 0;
        for (index, conversation) in conversations.iter().enumerate() {
            let outcome = self.segmenter.segment_conversation(conversation, cancel)?;
            failed_buckets += outcome.failed_buckets.len();
            tracker.advance(RunStage::Importing, index as u64 + 1, total, "Segmenting threads")?;
        }

        run.counters.threads_found = thread_repo::count_by_run(&self.db, &run.id)?;
        self.save_counters(run)?;
        info!(
            threads = run.counters.threads_found,
            failed_buckets, "Segmentation finished"
        );
        Ok(())
    }

    fn set_stage(&self, run: &mut RunRow, to: RunStage, error: Option<&str>) -> Result<(), IngestError> {
        let next = run.stage.transition(to)?;
        let updated_at = now_timestamp();
        self.retry.run("update_stage", || {
            run_repo::update_stage(&self.db, &run.id, next, error, &updated_at)
        })?;
        info!(from = %run.stage, to = %next, "Stage transition");
        run.stage = next;
        run.error = error.map(str::to_string);
        run.updated_at = updated_at;
        Ok(())
    }

    fn save_counters(&self, run: &RunRow) -> Result<(), IngestError> {
        let counters: RunCounters = run.counters;
        let updated_at = now_timestamp();
        self.retry.run("update_counters", || {
            run_repo::update_counters(&self.db, &run.id, &counters, &updated_at)
        })
    }

    fn record_failure(&self, run: &mut RunRow, cause: &IngestError) {
        let message = cause.failure_cause();
        error!(stage = %run.stage, "Run failed: {}", message);
        if let Err(e) = self.set_stage(run, RunStage::Failed, Some(message.as_str())) {
            error!("Failed to record run failure: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;
    use crate::error::LimitKind;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    const EXPORT: &str = r#"[{
        "title": "Hello",
        "conversation_id": "c-1",
        "mapping": {
            "r": {"message": null, "parent": null, "children": ["m"]},
            "m": {
                "message": {
                    "author": {"role": "user"},
                    "create_time": 1705312800,
                    "content": {"parts": ["hi"]},
                    "status": "finished_successfully"
                },
                "parent": "r",
                "children": []
            }
        }
    }]"#;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, data) in entries {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        std::fs::write(path, buf).unwrap();
    }

    fn setup(entries: &[(&str, &str)]) -> (TempDir, PipelineCoordinator, RunRow) {
        let dir = TempDir::new().unwrap();
        let config = Config::rooted_at(dir.path());
        let db = Database::open_in_memory().unwrap();
        let archive = dir.path().join("export.zip");
        write_zip(&archive, entries);
        let coordinator = PipelineCoordinator::new(Arc::new(config), db);
        let run = coordinator
            .register(&StoredArchive {
                run_id: "run-1".to_string(),
                path: archive,
                original_filename: "export.zip".to_string(),
                byte_size: 1,
                content_hash: "hash-1".to_string(),
            })
            .unwrap();
        (dir, coordinator, run)
    }

    #[test]
    fn test_run_completes_and_counts() {
        let (_dir, coordinator, run) = setup(&[("conversations.json", EXPORT), ("a.png", "x")]);
        let done = coordinator.run(&run.id, &CancellationToken::new()).unwrap();

        assert_eq!(done.stage, RunStage::Completed);
        assert_eq!(done.progress_percent, 100);
        assert!(done.completed_at.is_some());
        assert_eq!(
            done.counters,
            RunCounters {
                files_extracted: 2,
                conversations_found: 1,
                messages_found: 1,
                threads_found: 1,
            }
        );
        let files = extracted_file_repo::list_by_run(coordinator.database(), &run.id).unwrap();
        assert!(files.iter().any(|f| f.status == FileStatus::Parsed));
    }

    /// Trips the token as soon as the run is stored as completed.
    struct CancelOnCompletion {
        token: CancellationToken,
        failed: std::sync::Mutex<bool>,
    }

    impl ProgressReporter for CancelOnCompletion {
        fn report(&self, event: ProgressEvent) {
            match event {
                ProgressEvent::Stage {
                    stage: RunStage::Completed,
                    ..
                } => self.token.cancel(),
                ProgressEvent::Failed { .. } => *self.failed.lock().unwrap() = true,
                _ => {}
            }
        }
    }

    #[test]
    fn test_cancel_after_completion_keeps_run_completed() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("export.zip");
        write_zip(&archive, &[("conversations.json", EXPORT)]);
        let token = CancellationToken::new();
        let reporter = Arc::new(CancelOnCompletion {
            token: token.clone(),
            failed: std::sync::Mutex::new(false),
        });
        let coordinator = PipelineCoordinator::with_reporter(
            Arc::new(Config::rooted_at(dir.path())),
            Database::open_in_memory().unwrap(),
            reporter.clone(),
        );
        let run = coordinator
            .register(&StoredArchive {
                run_id: "run-1".to_string(),
                path: archive,
                original_filename: "export.zip".to_string(),
                byte_size: 1,
                content_hash: "hash-1".to_string(),
            })
            .unwrap();

        let done = coordinator.run(&run.id, &token).unwrap();
        assert!(token.is_cancelled());
        assert_eq!(done.stage, RunStage::Completed);
        assert!(done.error.is_none());
        assert!(!*reporter.failed.lock().unwrap());
    }

    #[test]
    fn test_terminal_run_returned_unchanged() {
        let (_dir, coordinator, run) = setup(&[("conversations.json", EXPORT)]);
        let token = CancellationToken::new();
        let first = coordinator.run(&run.id, &token).unwrap();
        let second = coordinator.run(&run.id, &token).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let (_dir, coordinator, _run) = setup(&[("conversations.json", EXPORT)]);
        let err = coordinator
            .run("missing", &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound { entity: "run", .. }));
    }

    #[test]
    fn test_limit_breach_fails_run() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::rooted_at(dir.path());
        config.limits.max_entry_count = 1;
        let archive = dir.path().join("export.zip");
        write_zip(&archive, &[("a.json", "[]"), ("b.json", "[]")]);
        let coordinator = PipelineCoordinator::new(Arc::new(config), Database::open_in_memory().unwrap());
        coordinator
            .register(&StoredArchive {
                run_id: "run-1".to_string(),
                path: archive,
                original_filename: "export.zip".to_string(),
                byte_size: 1,
                content_hash: "h".to_string(),
            })
            .unwrap();

        let err = coordinator
            .run("run-1", &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::LimitExceeded {
                limit: LimitKind::EntryCount,
                ..
            }
        ));
        let stored = coordinator.find_run("run-1").unwrap();
        assert_eq!(stored.stage, RunStage::Failed);
        assert!(stored.error.unwrap().starts_with("limit_exceeded: "));
        assert!(dir.path().join("extracted/run-1/a.json").exists());
    }

    #[test]
    fn test_cancelled_run_is_failed() {
        let (_dir, coordinator, run) = setup(&[("conversations.json", EXPORT)]);
        let token = CancellationToken::new();
        token.cancel();
        let err = coordinator.run(&run.id, &token).unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        let stored = coordinator.find_run(&run.id).unwrap();
        assert_eq!(stored.stage, RunStage::Failed);
        assert_eq!(stored.error.as_deref(), Some("cancelled: Run was cancelled"));
    }

    #[test]
    fn test_resume_from_importing_only_segments() {
        let (_dir, coordinator, run) = setup(&[("conversations.json", EXPORT)]);
        let db = coordinator.database().clone();
        let conv = test_support::insert_conversation(&db, &run.id, "pre");
        let messages = vec![test_support::message(&conv.id, 0, "2024-03-01T12:00:00.000Z")];
        db.with_tx(|conn| message_repo::insert_all(conn, &messages))
            .unwrap();
        conversation_repo::mark_imported(&db, &conv.id, 1).unwrap();
        run_repo::update_stage(&db, &run.id, RunStage::Importing, None, "2024-03-01T12:00:00.000Z")
            .unwrap();
        run_repo::raise_progress(&db, &run.id, 70, "2024-03-01T12:00:00.000Z").unwrap();

        let done = coordinator.run(&run.id, &CancellationToken::new()).unwrap();
        assert_eq!(done.stage, RunStage::Completed);
        assert_eq!(done.counters.threads_found, 1);
        assert_eq!(done.counters.files_extracted, 0);
        assert!(extracted_file_repo::list_by_run(&db, &run.id).unwrap().is_empty());
    }

    #[test]
    fn test_zero_candidates_completes_empty() {
        let (_dir, coordinator, run) = setup(&[("notes.txt", "hello")]);
        let done = coordinator.run(&run.id, &CancellationToken::new()).unwrap();
        assert_eq!(done.stage, RunStage::Completed);
        assert_eq!(done.counters.files_extracted, 1);
        assert_eq!(done.counters.conversations_found, 0);
    }
}
