//! Hardened extraction of untrusted export archives.

pub mod archive;
pub mod classify;
pub mod path;

pub use archive::{ArchiveExtractor, ExtractedEntry, ExtractionLimits, ExtractionReport, SkippedEntry};
pub use classify::{classify, FileKind};
