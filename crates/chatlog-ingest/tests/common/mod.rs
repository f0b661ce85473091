//! Shared utilities for chatlog-ingest integration tests.
//!
//! - `TestHarness`: an isolated data directory, database and zip fixtures
//! - builders for export JSON documents

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
