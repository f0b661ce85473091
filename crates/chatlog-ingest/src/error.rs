use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::pipeline::stage::RunStage;

/// Which configured cap an archive ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    ArchiveBytes,
    ExtractionBytes,
    EntryCount,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::ArchiveBytes => write!(f, "archive size"),
            LimitKind::ExtractionBytes => write!(f, "total uncompressed size"),
            LimitKind::EntryCount => write!(f, "entry count"),
        }
    }
}

/// Closed classification of [`IngestError`], recorded as the failure cause of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    LimitExceeded,
    Conflict,
    NotFound,
    TransientStorage,
    Storage,
    Io,
    Config,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientStorage => "transient_storage",
            ErrorKind::Storage => "storage",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Limit exceeded: {limit} is {actual}, maximum is {max}")]
    LimitExceeded {
        limit: LimitKind,
        actual: u64,
        max: u64,
    },

    #[error("Archive with content hash {content_hash} was already ingested by run {existing_run_id}")]
    Conflict {
        content_hash: String,
        existing_run_id: String,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage still contended after {attempts} attempts: {source}")]
    TransientStorage {
        attempts: u32,
        #[source]
        source: DatabaseError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Illegal stage transition from {from} to {to}")]
    IllegalTransition { from: RunStage, to: RunStage },

    #[error("Run was cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn validation(message: impl Into<String>) -> Self {
        IngestError::Validation {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validation { .. } | IngestError::Parse(_) => ErrorKind::Validation,
            IngestError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            IngestError::Conflict { .. } => ErrorKind::Conflict,
            IngestError::NotFound { .. } => ErrorKind::NotFound,
            IngestError::TransientStorage { .. } => ErrorKind::TransientStorage,
            IngestError::Database(_) | IngestError::IllegalTransition { .. } => ErrorKind::Storage,
            IngestError::Io { .. } => ErrorKind::Io,
            IngestError::Config(_) => ErrorKind::Config,
            IngestError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a failure is scoped to one file or conversation.
    ///
    /// Recoverable errors are logged and skipped; everything else ends the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IngestError::Parse(_))
    }

    /// The text stored on a failed run: `"<kind>: <message>"`.
    pub fn failure_cause(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Entry-level extraction failures. These skip the entry, never the archive.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Unsafe entry path '{entry}': {reason}")]
    UnsafePath { entry: String, reason: &'static str },

    #[error("Failed to create target for entry '{entry}': {source}")]
    CreateTarget {
        entry: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read entry '{entry}': {source}")]
    ReadEntry {
        entry: String,
        #[source]
        source: std::io::Error,
    },
}

/// File- and conversation-level parse failures.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read export file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed export JSON in '{path}': {source}")]
    MalformedJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Export file '{path}' holds neither a conversation list nor a conversation")]
    UnexpectedShape { path: PathBuf },

    #[error("Conversation #{index} is malformed: {source}")]
    MalformedConversation {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Conversation '{title}' has no nodes")]
    EmptyConversation { title: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Run {run_id} is already queued or running")]
    AlreadyQueued { run_id: String },
}

pub type Result<T> = std::result::Result<T, IngestError>;
