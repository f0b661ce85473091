use crate::broadcast::{RunProgressBroadcaster, RunProgressEvent};
use crate::db::run_repo::{self, RunCounters};
use crate::db::{now_timestamp, Database, RetryPolicy};
use crate::error::IngestError;

use super::stage::RunStage;

/// Events emitted by the coordinator while a run advances.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Stage {
        run_id: String,
        stage: RunStage,
        percent: u8,
    },
    Advanced {
        run_id: String,
        stage: RunStage,
        percent: u8,
        message: String,
    },
    Completed {
        run_id: String,
        counters: RunCounters,
    },
    Failed {
        run_id: String,
        percent: u8,
        error: String,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for callers that only poll the run record.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Bridges coordinator events onto a [`RunProgressBroadcaster`].
pub struct BroadcastProgress {
    broadcaster: RunProgressBroadcaster,
}

impl BroadcastProgress {
    pub fn new(broadcaster: RunProgressBroadcaster) -> Self {
        Self { broadcaster }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        let event = match event {
            ProgressEvent::Stage {
                run_id,
                stage,
                percent,
            } => RunProgressEvent::new(&run_id, stage, percent, &format!("Stage {}", stage)),
            ProgressEvent::Advanced {
                run_id,
                stage,
                percent,
                message,
            } => RunProgressEvent::new(&run_id, stage, percent, &message),
            ProgressEvent::Completed { run_id, counters } => {
                RunProgressEvent::completed(&run_id, &counters)
            }
            ProgressEvent::Failed {
                run_id,
                percent,
                error,
            } => RunProgressEvent::failed(&run_id, percent, &error),
        };
        self.broadcaster.send(event);
    }
}

/// Maps `done` of `total` units into a stage's progress band.
pub fn percent_within(stage: RunStage, done: u64, total: u64) -> u8 {
    let (start, end) = stage.progress_band();
    if total == 0 {
        return end;
    }
    let span = u64::from(end - start);
    start + (span * done.min(total) / total) as u8
}

/// Coordinator-owned progress of one run. Never moves backwards.
///
/// The stored value is written only when the integer percent grows.
pub struct ProgressTracker<'a> {
    db: &'a Database,
    retry: &'a RetryPolicy,
    run_id: &'a str,
    reporter: &'a dyn ProgressReporter,
    percent: u8,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(
        db: &'a Database,
        retry: &'a RetryPolicy,
        run_id: &'a str,
        start_percent: u8,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            db,
            retry,
            run_id,
            reporter,
            percent: start_percent,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Announces a stage and raises progress to the start of its band.
    pub fn enter(&mut self, stage: RunStage) -> Result<(), IngestError> {
        let (start, _) = stage.progress_band();
        self.raise(stage, start, None)?;
        self.reporter.report(ProgressEvent::Stage {
            run_id: self.run_id.to_string(),
            stage,
            percent: self.percent,
        });
        Ok(())
    }

    /// Records that `done` of `total` units of `stage` have finished.
    pub fn advance(
        &mut self,
        stage: RunStage,
        done: u64,
        total: u64,
        message: &str,
    ) -> Result<bool, IngestError> {
        self.raise(stage, percent_within(stage, done, total), Some(message))
    }

    fn raise(
        &mut self,
        stage: RunStage,
        percent: u8,
        message: Option<&str>,
    ) -> Result<bool, IngestError> {
        let percent = percent.min(100);
        if percent <= self.percent {
            return Ok(false);
        }
        let updated_at = now_timestamp();
        self.retry.run("raise_progress", || {
            run_repo::raise_progress(self.db, self.run_id, percent, &updated_at)
        })?;
        self.percent = percent;

        if let Some(message) = message {
            self.reporter.report(ProgressEvent::Advanced {
                run_id: self.run_id.to_string(),
                stage,
                percent,
                message: message.to_string(),
            });
        }
        Ok(true)
    }
}
