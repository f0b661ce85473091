pub mod cancel;
pub mod job;
pub mod pool;

pub use cancel::CancellationToken;
pub use job::{IngestJob, RunOutcome};
pub use pool::{Canceller, WorkerPool};

// Re-export crossbeam_channel for use in the CLI
pub use crossbeam_channel;
