//! Advisory file classification for the parse stage. Not a security boundary.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// JSON that probably holds conversations.
    CandidateExport,
    /// Media and documents that ride along with an export.
    Auxiliary,
    Unknown,
}

#[derive(Error, Debug)]
#[error("Unknown file kind '{0}'")]
pub struct UnknownFileKind(pub String);

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::CandidateExport => "candidate_export",
            FileKind::Auxiliary => "auxiliary",
            FileKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = UnknownFileKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "candidate_export" => Ok(FileKind::CandidateExport),
            "auxiliary" => Ok(FileKind::Auxiliary),
            "unknown" => Ok(FileKind::Unknown),
            other => Err(UnknownFileKind(other.to_string())),
        }
    }
}

const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "mp3", "mp4", "wav", "pdf",
];

static RE_EXPORT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(conversation|chat|message)").unwrap());

/// Classifies an extracted file by extension and path tokens.
pub fn classify(relative_path: &Path) -> FileKind {
    let extension = relative_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if extension == "json" {
        let path_text = relative_path.to_string_lossy();
        return if RE_EXPORT_TOKEN.is_match(&path_text) {
            FileKind::CandidateExport
        } else {
            FileKind::Unknown
        };
    }

    if MEDIA_EXTENSIONS.contains(&extension.as_str()) {
        return FileKind::Auxiliary;
    }

    match mime_guess::from_path(relative_path).first() {
        Some(mime) if matches!(mime.type_().as_str(), "image" | "audio" | "video") => {
            FileKind::Auxiliary
        }
        _ => FileKind::Unknown,
    }
}
