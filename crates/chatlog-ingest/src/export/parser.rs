use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, UnfinishedAncestors};
use crate::db::batch::write_in_batches;
use crate::db::conversation_repo::{self, ConversationRow};
use crate::db::message_repo::{self, MessageRow};
use crate::db::{format_timestamp, Database, RetryPolicy};
use crate::error::{IngestError, ParseError};
use crate::sanitize;
use crate::transcript::TranscriptWriter;
use crate::worker::CancellationToken;

use super::model::ExportConversation;
use super::tree::{self, TreeWarning};

const TITLE_LOG_LIMIT: usize = 80;

/// Result of importing one conversation.
#[derive(Debug)]
pub enum ImportOutcome {
    /// Newly imported; `batches` are the committed message batch sizes.
    Created {
        conversation: ConversationRow,
        batches: Vec<usize>,
    },
    /// Already imported by an earlier parse of the same run; nothing was written.
    Existing(ConversationRow),
}

impl ImportOutcome {
    pub fn conversation(&self) -> &ConversationRow {
        match self {
            ImportOutcome::Created { conversation, .. } => conversation,
            ImportOutcome::Existing(conversation) => conversation,
        }
    }
}

/// Per-file tally returned by [`ExportParser::parse_file`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub conversations: usize,
    pub created: usize,
    pub existing: usize,
    pub skipped: usize,
    pub messages: u64,
}

/// Turns extracted export files into conversations and ordered messages.
pub struct ExportParser {
    db: Database,
    retry: RetryPolicy,
    message_batch_size: usize,
    policy: UnfinishedAncestors,
    transcript: Option<TranscriptWriter>,
}

impl ExportParser {
    pub fn new(
        db: Database,
        retry: RetryPolicy,
        message_batch_size: usize,
        policy: UnfinishedAncestors,
    ) -> Self {
        Self {
            db,
            retry,
            message_batch_size,
            policy,
            transcript: None,
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Self {
        Self::new(
            db,
            RetryPolicy::from_config(&config.retry),
            config.batching.message_batch_size,
            config.parser.unfinished_ancestors,
        )
        .with_transcript(TranscriptWriter::new(&config.directories.messages_dir))
    }

    pub fn with_transcript(mut self, writer: TranscriptWriter) -> Self {
        self.transcript = Some(writer);
        self
    }

    /// Parses every conversation in one export file.
    ///
    /// An unreadable or malformed file fails as a whole with a recoverable
    /// [`IngestError::Parse`]. A malformed conversation inside a good file is
    /// skipped. `source_label` is stored on each conversation.
    pub fn parse_file(
        &self,
        run_id: &str,
        path: &Path,
        source_label: &str,
        cancel: &CancellationToken,
    ) -> Result<FileSummary, IngestError> {
        let file = sanitize::redact_path(path);
        let documents = load_export(path)?;
        let mut summary = FileSummary {
            conversations: documents.len(),
            ..FileSummary::default()
        };

        for (index, value) in documents.into_iter().enumerate() {
            cancel.check()?;

            let outcome = ExportConversation::from_value(index, value)
                .map_err(IngestError::from)
                .and_then(|conv| self.import_conversation(run_id, &conv, source_label, cancel));

            match outcome {
                Ok(ImportOutcome::Created { conversation, .. }) => {
                    summary.created += 1;
                    summary.messages += conversation.message_count;
                }
                Ok(ImportOutcome::Existing(_)) => summary.existing += 1,
                Err(e) if e.is_recoverable() => {
                    warn!(file = %file, index, "Skipping conversation: {}", e);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            file = %file,
            conversations = summary.conversations,
            created = summary.created,
            existing = summary.existing,
            skipped = summary.skipped,
            messages = summary.messages,
            "Parsed export file"
        );

        Ok(summary)
    }

    /// Imports one conversation: walks its tree, stores it and its messages.
    ///
    /// A conversation already imported for this run is returned untouched. One
    /// left half-written by an interrupted run is cleared and imported again.
    pub fn import_conversation(
        &self,
        run_id: &str,
        conversation: &ExportConversation,
        source_label: &str,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, IngestError> {
        let title = sanitize::truncate_for_log(conversation.title(), TITLE_LOG_LIMIT);

        let mut existing = match conversation.declared_id() {
            Some(id) => self.find_existing(run_id, id)?,
            None => None,
        };
        if let Some(row) = existing.as_ref().filter(|row| row.imported) {
            debug!(title = %title, "Conversation already imported");
            return Ok(ImportOutcome::Existing(row.clone()));
        }

        let walk = tree::walk(&conversation.mapping, self.policy).ok_or_else(|| {
            ParseError::EmptyConversation {
                title: title.clone(),
            }
        })?;
        for warning in &walk.warnings {
            log_tree_warning(&title, warning);
        }

        let external_id = conversation.external_id(walk.root);
        if conversation.declared_id().is_none() {
            existing = self.find_existing(run_id, &external_id)?;
        }

        let row = match existing {
            Some(row) if row.imported => {
                debug!(title = %title, "Conversation already imported");
                return Ok(ImportOutcome::Existing(row));
            }
            Some(row) => {
                warn!(title = %title, "Re-importing partially written conversation");
                self.retry.run("clear_conversation", || {
                    message_repo::delete_by_conversation(&self.db, &row.id)
                })?;
                row
            }
            None => {
                let row = ConversationRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    external_id,
                    title: conversation.title().to_string(),
                    declared_created_at: conversation
                        .create_time
                        .and_then(super::model::epoch_to_utc)
                        .map(|t| format_timestamp(&t)),
                    declared_updated_at: conversation
                        .update_time
                        .and_then(super::model::epoch_to_utc)
                        .map(|t| format_timestamp(&t)),
                    source_file: source_label.to_string(),
                    message_count: 0,
                    imported: false,
                    created_at: format_timestamp(&Utc::now()),
                };
                self.retry
                    .run("insert_conversation", || conversation_repo::insert(&self.db, &row))?;
                row
            }
        };

        let messages = build_messages(&row.id, conversation, &walk.emitted);
        let estimated = messages.iter().filter(|m| m.timestamp_estimated).count();
        if estimated > 0 {
            warn!(
                title = %title,
                estimated,
                "Messages without a usable timestamp were stamped with the processing time"
            );
        }

        let batches = write_in_batches(
            &self.db,
            &self.retry,
            &messages,
            self.message_batch_size,
            cancel,
            message_repo::insert_all,
        )?;

        let count = messages.len() as u64;
        self.retry.run("mark_imported", || {
            conversation_repo::mark_imported(&self.db, &row.id, count)
        })?;

        if let Some(writer) = &self.transcript {
            if let Err(e) = writer.append(&messages) {
                warn!(title = %title, "Failed to append transcript: {}", e);
            }
        }

        debug!(title = %title, messages = count, batches = batches.len(), "Imported conversation");

        Ok(ImportOutcome::Created {
            conversation: ConversationRow {
                message_count: count,
                imported: true,
                ..row
            },
            batches,
        })
    }

    fn find_existing(
        &self,
        run_id: &str,
        external_id: &str,
    ) -> Result<Option<ConversationRow>, IngestError> {
        self.retry.run("find_conversation", || {
            conversation_repo::find_by_external_id(&self.db, run_id, external_id)
        })
    }
}

/// Reads an export file as a list of raw conversation values.
///
/// A single top-level object is treated as a one-element list.
pub fn load_export(path: &Path) -> Result<Vec<Value>, ParseError> {
    let content = std::fs::read(path).map_err(|source| ParseError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let document: Value =
        serde_json::from_slice(&content).map_err(|source| ParseError::MalformedJson {
            path: path.to_path_buf(),
            source,
        })?;

    match document {
        Value::Array(items) => Ok(items),
        object @ Value::Object(_) => Ok(vec![object]),
        _ => Err(ParseError::UnexpectedShape {
            path: path.to_path_buf(),
        }),
    }
}

fn build_messages(
    conversation_id: &str,
    conversation: &ExportConversation,
    emitted: &[&str],
) -> Vec<MessageRow> {
    let processed_at = Utc::now();
    emitted
        .iter()
        .filter_map(|id| {
            let node = conversation.mapping.get(*id)?;
            let message = node.message.as_ref()?;
            Some((*id, message))
        })
        .enumerate()
        .map(|(index, (node_id, message))| {
            let authored = message.timestamp();
            MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                external_id: message.id.clone().unwrap_or_else(|| node_id.to_string()),
                role: message.role(),
                content: message.text(),
                timestamp: format_timestamp(&authored.unwrap_or(processed_at)),
                timestamp_estimated: authored.is_none(),
                sequence_index: index as u64,
            }
        })
        .collect()
}

fn log_tree_warning(title: &str, warning: &TreeWarning) {
    match warning {
        TreeWarning::NoRoot => {
            warn!(title = %title, "No parentless node, using the lowest node id as root")
        }
        TreeWarning::MultipleRoots { count } => {
            warn!(title = %title, count, "Several parentless nodes, using the lowest id as root")
        }
        TreeWarning::Revisit { node } => {
            warn!(title = %title, node = %node, "Node reached twice, dropping the revisit")
        }
        TreeWarning::MissingChild { parent, child } => {
            warn!(title = %title, parent = %parent, child = %child, "Child node missing from mapping")
        }
    }
}
