//! Ingestion of branching chat export archives.
//!
//! An archive passes through [`Intake`], then a [`PipelineCoordinator`] drives
//! the run through extraction, parsing and per-day thread segmentation, with
//! every step persisted so an interrupted run can resume.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod extract;
pub mod intake;
pub mod pipeline;
pub mod sanitize;
pub mod segment;
pub mod telemetry;
pub mod transcript;
pub mod worker;

pub use broadcast::{RunProgressBroadcaster, RunProgressEvent};
pub use config::{load_config, Config};
pub use db::{Database, DatabaseError, RetryPolicy};
pub use error::{ErrorKind, IngestError, ParseError, Result, WorkerError};
pub use export::ExportParser;
pub use extract::ArchiveExtractor;
pub use intake::{ArchiveSubmission, Intake, StoredArchive};
pub use pipeline::{BroadcastProgress, PipelineCoordinator, RunStage};
pub use segment::ThreadSegmenter;
pub use transcript::TranscriptWriter;
pub use worker::{CancellationToken, RunOutcome, WorkerPool};
