//! The run lifecycle as a closed state machine.
//!
//! ```text
//! pending -> extracting -> parsing -> importing -> completed
//!    \____________\____________\__________\-----> failed
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    Extracting,
    Parsing,
    Importing,
    Completed,
    Failed,
}

#[derive(Error, Debug)]
#[error("Unknown run stage '{0}'")]
pub struct UnknownStage(pub String);

impl RunStage {
    pub const ALL: [RunStage; 6] = [
        RunStage::Pending,
        RunStage::Extracting,
        RunStage::Parsing,
        RunStage::Importing,
        RunStage::Completed,
        RunStage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Pending => "pending",
            RunStage::Extracting => "extracting",
            RunStage::Parsing => "parsing",
            RunStage::Importing => "importing",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Completed | RunStage::Failed)
    }

    /// The forward successor, if any.
    pub fn next(&self) -> Option<RunStage> {
        match self {
            RunStage::Pending => Some(RunStage::Extracting),
            RunStage::Extracting => Some(RunStage::Parsing),
            RunStage::Parsing => Some(RunStage::Importing),
            RunStage::Importing => Some(RunStage::Completed),
            RunStage::Completed | RunStage::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: RunStage) -> bool {
        use RunStage::*;
        match (self, to) {
            (Pending, Extracting)
            | (Extracting, Parsing)
            | (Parsing, Importing)
            | (Importing, Completed) => true,
            (Pending | Extracting | Parsing | Importing, Failed) => true,
            _ => false,
        }
    }

    pub fn transition(self, to: RunStage) -> Result<RunStage, IngestError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(IngestError::IllegalTransition { from: self, to })
        }
    }

    /// Progress range owned by this stage, as `(start, end)` percent.
    pub fn progress_band(&self) -> (u8, u8) {
        match self {
            RunStage::Pending => (0, 0),
            RunStage::Extracting => (0, 40),
            RunStage::Parsing => (40, 70),
            RunStage::Importing => (70, 95),
            RunStage::Completed => (100, 100),
            RunStage::Failed => (0, 100),
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
