//! Isolated environment for driving whole runs.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use chatlog_ingest::db::run_repo::RunRow;
use chatlog_ingest::{
    ArchiveSubmission, CancellationToken, Config, Database, IngestError, Intake,
    PipelineCoordinator,
};

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: Config,
    pub db: Database,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Builds a harness whose config can be tweaked before anything is opened.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = Config::rooted_at(temp_dir.path());
        tweak(&mut config);
        let db = Database::open(&config.database.path).expect("Failed to open database");
        Self {
            temp_dir,
            config,
            db,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a zip archive with the given entries into the scratch directory.
    pub fn write_archive(&self, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, zip_bytes(entries)).expect("Failed to write archive");
        path
    }

    pub fn intake(&self) -> Intake {
        Intake::new(self.db.clone(), &self.config)
    }

    pub fn coordinator(&self) -> PipelineCoordinator {
        PipelineCoordinator::new(Arc::new(self.config.clone()), self.db.clone())
    }

    /// Accepts archive bytes as an upload named `name`.
    pub fn submit(&self, name: &str, entries: &[(&str, &[u8])]) -> Result<ArchiveSubmission, IngestError> {
        let bytes = zip_bytes(entries);
        self.intake()
            .accept(Cursor::new(&bytes), name, bytes.len() as u64)
    }

    /// Submits and runs an archive to a terminal stage.
    pub fn ingest(&self, entries: &[(&str, &[u8])]) -> (String, Result<RunRow, IngestError>) {
        let submission = self.submit("export.zip", entries).expect("Failed to accept archive");
        let result = self
            .coordinator()
            .run(&submission.run_id, &CancellationToken::new());
        (submission.run_id, result)
    }

    pub fn extracted_dir(&self, run_id: &str) -> PathBuf {
        self.config.directories.extracted_dir.join(run_id)
    }

    pub fn transcript(&self, date: &str) -> Option<String> {
        std::fs::read_to_string(self.config.directories.messages_dir.join(format!("{date}.md"))).ok()
    }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default())
                .expect("Failed to start zip entry");
            zip.write_all(data).expect("Failed to write zip entry");
        }
        zip.finish().expect("Failed to finish zip");
    }
    buf
}
