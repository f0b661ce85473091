use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::batch::write_in_batches;
use crate::db::conversation_repo::ConversationRow;
use crate::db::message_repo::{self, MessageRow};
use crate::db::thread_repo::{self, ThreadRow};
use crate::db::{now_timestamp, parse_timestamp, Database, RetryPolicy};
use crate::error::IngestError;
use crate::worker::CancellationToken;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A date bucket that could not become a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketFailure {
    pub date: String,
    pub reason: String,
}

/// Threads to create for one conversation, computed without touching storage.
#[derive(Debug, Default)]
pub struct SegmentPlan {
    pub threads: Vec<ThreadRow>,
    pub skipped_existing: usize,
    pub failed: Vec<BucketFailure>,
    /// Messages whose stored timestamp could not be read.
    pub unreadable: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub created: usize,
    pub skipped_existing: usize,
    pub failed_buckets: Vec<BucketFailure>,
    pub batches: Vec<usize>,
}

/// Groups a conversation's messages into one thread per UTC date.
pub struct ThreadSegmenter {
    db: Database,
    retry: RetryPolicy,
    thread_batch_size: usize,
}

impl ThreadSegmenter {
    pub fn new(db: Database, retry: RetryPolicy, thread_batch_size: usize) -> Self {
        Self {
            db,
            retry,
            thread_batch_size,
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Self {
        Self::new(
            db,
            RetryPolicy::from_config(&config.retry),
            config.batching.thread_batch_size,
        )
    }

    /// Creates the missing threads of one conversation. Safe to call repeatedly.
    pub fn segment_conversation(
        &self,
        conversation: &ConversationRow,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutcome, IngestError> {
        cancel.check()?;

        let messages = self.retry.run("list_messages", || {
            message_repo::list_by_conversation(&self.db, &conversation.id)
        })?;
        let existing = self.retry.run("existing_threads", || {
            thread_repo::existing_dates(&self.db, &conversation.id)
        })?;

        let plan = plan(&conversation.id, &messages, &existing, &now_timestamp());
        if plan.unreadable > 0 {
            warn!(
                conversation_id = %conversation.id,
                count = plan.unreadable,
                "Messages with unreadable timestamps left out of threads"
            );
        }
        for failure in &plan.failed {
            warn!(
                conversation_id = %conversation.id,
                date = %failure.date,
                "Thread bucket rejected: {}",
                failure.reason
            );
        }

        let batches = write_in_batches(
            &self.db,
            &self.retry,
            &plan.threads,
            self.thread_batch_size,
            cancel,
            |conn, chunk| thread_repo::insert_all(conn, chunk).map(|_| ()),
        )?;

        debug!(
            conversation_id = %conversation.id,
            created = plan.threads.len(),
            skipped = plan.skipped_existing,
            "Segmented conversation"
        );

        Ok(SegmentOutcome {
            created: plan.threads.len(),
            skipped_existing: plan.skipped_existing,
            failed_buckets: plan.failed,
            batches,
        })
    }
}

struct Dated<'a> {
    message: &'a MessageRow,
    instant: DateTime<Utc>,
}

/// Buckets `messages` by UTC date and builds one validated thread per new date.
///
/// Dates in `existing` are skipped. Within a bucket the lowest and highest
/// sequence index become the thread's start and end.
pub fn plan(
    conversation_id: &str,
    messages: &[MessageRow],
    existing: &BTreeSet<String>,
    created_at: &str,
) -> SegmentPlan {
    let mut result = SegmentPlan::default();
    let mut buckets: BTreeMap<String, Vec<Dated<'_>>> = BTreeMap::new();

    for message in messages {
        match parse_timestamp(&message.timestamp) {
            Some(instant) => buckets
                .entry(instant.format(DATE_FORMAT).to_string())
                .or_default()
                .push(Dated { message, instant }),
            None => result.unreadable += 1,
        }
    }

    for (date, bucket) in buckets {
        if existing.contains(&date) {
            result.skipped_existing += 1;
            continue;
        }
        let (Some(first), Some(last)) = (
            bucket.iter().min_by_key(|d| d.message.sequence_index),
            bucket.iter().max_by_key(|d| d.message.sequence_index),
        ) else {
            continue;
        };

        match validate_bucket(conversation_id, &date, first, last) {
            Ok(()) => result.threads.push(ThreadRow {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                date,
                message_count: bucket.len() as u64,
                start_sequence: first.message.sequence_index,
                end_sequence: last.message.sequence_index,
                start_message_id: first.message.id.clone(),
                end_message_id: last.message.id.clone(),
                start_timestamp: first.message.timestamp.clone(),
                end_timestamp: last.message.timestamp.clone(),
                created_at: created_at.to_string(),
            }),
            Err(reason) => result.failed.push(BucketFailure { date, reason }),
        }
    }

    result
}

fn validate_bucket(
    conversation_id: &str,
    date: &str,
    first: &Dated<'_>,
    last: &Dated<'_>,
) -> Result<(), String> {
    for end in [first, last] {
        if end.message.conversation_id != conversation_id {
            return Err(format!(
                "message {} belongs to another conversation",
                end.message.id
            ));
        }
        let own_date = end.instant.format(DATE_FORMAT).to_string();
        if own_date != date {
            warn!(
                conversation_id,
                date,
                message_date = %own_date,
                "Thread boundary message dated outside its bucket"
            );
        }
    }
    if first.instant > last.instant {
        return Err(format!(
            "start {} is after end {}",
            first.message.timestamp, last.message.timestamp
        ));
    }
    Ok(())
}
