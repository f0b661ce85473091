//! Per-day text artifact of user-authored messages.
//!
//! One markdown file per UTC date under the messages directory. Conversations
//! contributing to the same date append to the same file.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::db::message_repo::MessageRow;
use crate::db::parse_timestamp;
use crate::error::IngestError;
use crate::export::model::Role;

#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    dir: PathBuf,
    // Serializes appends from concurrent runs sharing one writer.
    lock: Arc<Mutex<()>>,
}

impl TranscriptWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.md", date))
    }

    /// Appends the user messages of one conversation to their date files.
    ///
    /// Returns the dates that were written to.
    pub fn append(&self, messages: &[MessageRow]) -> Result<Vec<String>, IngestError> {
        let mut by_date: BTreeMap<&str, Vec<&MessageRow>> = BTreeMap::new();
        for message in messages.iter().filter(|m| m.role == Role::User) {
            if let Some(date) = message.timestamp.get(..10) {
                by_date.entry(date).or_default().push(message);
            }
        }
        if by_date.is_empty() {
            return Ok(Vec::new());
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| IngestError::io(&self.dir, e))?;
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut written = Vec::with_capacity(by_date.len());
        for (date, mut entries) in by_date {
            entries.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.sequence_index.cmp(&b.sequence_index))
            });

            let path = self.path_for(date);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| IngestError::io(&path, e))?;
            let is_new = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

            let mut block = String::new();
            if is_new {
                let _ = write!(block, "# Messages for {}\n\n", date);
            }
            for entry in entries {
                let _ = write!(
                    block,
                    "## {}\n\n{}\n\n---\n\n",
                    clock_time(&entry.timestamp),
                    entry.content
                );
            }

            file.write_all(block.as_bytes())
                .map_err(|e| IngestError::io(&path, e))?;
            written.push(date.to_string());
        }

        Ok(written)
    }
}

fn clock_time(timestamp: &str) -> String {
    match parse_timestamp(timestamp) {
        Some(instant) => instant.format("%H:%M:%S").to_string(),
        None => timestamp.get(11..19).unwrap_or("00:00:00").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;
    use tempfile::TempDir;

    fn user(seq: u64, timestamp: &str, content: &str) -> MessageRow {
        let mut row = test_support::message("conv", seq, timestamp);
        row.content = content.to_string();
        row
    }

    #[test]
    fn test_writes_header_and_entries_in_time_order() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path().join("messages"));
        let mut assistant = user(1, "2024-01-15T09:30:00.000Z", "ignored reply");
        assistant.role = Role::Assistant;

        let dates = writer
            .append(&[
                user(2, "2024-01-15T10:00:00.000Z", "later"),
                assistant,
                user(0, "2024-01-15T09:00:00.000Z", "earlier"),
            ])
            .unwrap();
        assert_eq!(dates, vec!["2024-01-15"]);

        let text = std::fs::read_to_string(writer.path_for("2024-01-15")).unwrap();
        assert_eq!(
            text,
            "# Messages for 2024-01-15\n\n\
             ## 09:00:00\n\nearlier\n\n---\n\n\
             ## 10:00:00\n\nlater\n\n---\n\n"
        );
    }

    #[test]
    fn test_second_conversation_appends_without_new_header() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer
            .append(&[user(0, "2024-01-15T09:00:00.000Z", "first")])
            .unwrap();
        writer
            .append(&[user(0, "2024-01-15T08:00:00.000Z", "second")])
            .unwrap();

        let text = std::fs::read_to_string(writer.path_for("2024-01-15")).unwrap();
        assert_eq!(text.matches("# Messages for").count(), 1);
        assert!(text.find("first").unwrap() < text.find("second").unwrap());
    }

    #[test]
    fn test_splits_by_utc_date() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        let dates = writer
            .append(&[
                user(0, "2024-01-15T23:59:59.000Z", "a"),
                user(1, "2024-01-16T00:00:01.000Z", "b"),
            ])
            .unwrap();
        assert_eq!(dates, vec!["2024-01-15", "2024-01-16"]);
        assert!(writer.path_for("2024-01-16").exists());
    }

    #[test]
    fn test_no_user_messages_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let writer = TranscriptWriter::new(dir.path().join("messages"));
        let mut row = user(0, "2024-01-15T09:00:00.000Z", "x");
        row.role = Role::System;
        assert!(writer.append(&[row]).unwrap().is_empty());
        assert!(!writer.dir().exists());
    }
}
