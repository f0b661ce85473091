//! Bounded exponential backoff around contended writes.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::IngestError;

use super::DatabaseError;

/// Retries an operation while it fails with a transient storage error.
///
/// The delay before retry `n` (1-based) is `initial_backoff * 2^(n-1)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.initial_backoff())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exponent)
    }

    pub fn run<T, F>(&self, operation: &str, mut f: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Result<T, DatabaseError>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_retries {
                        tracing::error!(
                            operation,
                            attempts = attempt + 1,
                            "Giving up on contended write: {}",
                            e
                        );
                        return Err(IngestError::TransientStorage {
                            attempts: attempt + 1,
                            source: e,
                        });
                    }
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Storage busy, retrying: {}",
                        e
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(IngestError::Database(e)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
