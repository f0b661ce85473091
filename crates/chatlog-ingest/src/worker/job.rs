use crate::db::run_repo::RunRow;
use crate::error::{ErrorKind, IngestError};
use crate::pipeline::stage::RunStage;

/// A request to drive one run to a terminal stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestJob {
    pub id: String,
    pub run_id: String,
}

impl IngestJob {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
        }
    }
}

/// How a job ended, as reported back from a worker.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_id: String,
    pub run_id: String,
    pub stage: RunStage,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl RunOutcome {
    pub fn success(job: &IngestJob, run: &RunRow) -> Self {
        Self {
            job_id: job.id.clone(),
            run_id: run.id.clone(),
            stage: run.stage,
            error: run.error.clone(),
            error_kind: None,
        }
    }

    pub fn failure(job: &IngestJob, error: &IngestError) -> Self {
        Self {
            job_id: job.id.clone(),
            run_id: job.run_id.clone(),
            stage: RunStage::Failed,
            error: Some(error.failure_cause()),
            error_kind: Some(error.kind()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.stage == RunStage::Completed
    }
}
