//! Broadcasting of run status for observers (CLI, embedding applications).

pub mod run_progress;

pub use run_progress::{RunProgressBroadcaster, RunProgressEvent, RunSummary};
