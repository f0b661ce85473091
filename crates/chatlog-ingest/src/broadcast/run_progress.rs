//! Run progress broadcaster for observers of ingestion runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::run_repo::RunCounters;
use crate::pipeline::stage::RunStage;

const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub files_extracted: u64,
    pub conversations_found: u64,
    pub messages_found: u64,
    pub threads_found: u64,
}

impl From<&RunCounters> for RunSummary {
    fn from(counters: &RunCounters) -> Self {
        Self {
            files_extracted: counters.files_extracted,
            conversations_found: counters.conversations_found,
            messages_found: counters.messages_found,
            threads_found: counters.threads_found,
        }
    }
}

/// Progress event for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgressEvent {
    pub run_id: String,
    pub stage: RunStage,
    pub progress_percent: u8,
    /// Human-readable description of the current activity.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Set once the run completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    /// Recorded failure cause (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunProgressEvent {
    pub fn new(run_id: &str, stage: RunStage, progress_percent: u8, message: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            progress_percent,
            message: message.to_string(),
            timestamp: Utc::now(),
            summary: None,
            error: None,
        }
    }

    pub fn completed(run_id: &str, counters: &RunCounters) -> Self {
        Self {
            summary: Some(RunSummary::from(counters)),
            ..Self::new(run_id, RunStage::Completed, 100, "Run completed")
        }
    }

    pub fn failed(run_id: &str, progress_percent: u8, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(run_id, RunStage::Failed, progress_percent, "Run failed")
        }
    }
}

/// Broadcasts run progress events to any number of subscribers.
#[derive(Clone)]
pub struct RunProgressBroadcaster {
    sender: Arc<broadcast::Sender<RunProgressEvent>>,
}

impl RunProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: RunProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunProgressEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RunProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
