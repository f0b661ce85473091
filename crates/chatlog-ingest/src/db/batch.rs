//! Fixed-size batched writes.

use rusqlite::Connection;

use crate::error::IngestError;
use crate::worker::CancellationToken;

use super::{Database, DatabaseError, RetryPolicy};

/// Writes `rows` in chunks of `batch_size`, each chunk in its own retried transaction.
///
/// Returns the committed chunk sizes in order. A failure leaves earlier chunks committed.
pub fn write_in_batches<T, F>(
    db: &Database,
    retry: &RetryPolicy,
    rows: &[T],
    batch_size: usize,
    cancel: &CancellationToken,
    mut write: F,
) -> Result<Vec<usize>, IngestError>
where
    F: FnMut(&Connection, &[T]) -> Result<(), DatabaseError>,
{
    let mut committed = Vec::with_capacity(rows.len() / batch_size.max(1) + 1);

    for chunk in rows.chunks(batch_size.max(1)) {
        cancel.check()?;
        retry.run("batch_write", || db.with_tx(|conn| write(conn, chunk)))?;
        committed.push(chunk.len());
        tracing::trace!(rows = chunk.len(), batch = committed.len(), "Committed batch");
    }

    Ok(committed)
}
