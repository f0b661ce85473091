//! Run orchestration: the stage machine, progress accounting and the coordinator.

pub mod progress;
pub mod runner;
pub mod stage;

pub use progress::{
    percent_within, BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter,
    ProgressTracker,
};
pub use runner::PipelineCoordinator;
pub use stage::{RunStage, UnknownStage};
