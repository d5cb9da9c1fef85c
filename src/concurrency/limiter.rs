//! Concurrency limiter with a bounded queueing time
//!
//! A request waits at most `max_queue_duration` for one of
//! `max_concurrent` slots. When no slot frees up in time it is rejected
//! with [`LimitError`] instead of piling up, so callers can answer
//! "429 Too Many Requests" and clients back off.

use crate::storage::error::StorageError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The limiter could not grant a slot in time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot handle more than {limit} concurrent {kind} requests; waited {waited:?} for a free slot")]
pub struct LimitError {
    pub kind: &'static str,
    pub limit: usize,
    pub waited: Duration,
}

impl From<LimitError> for StorageError {
    fn from(err: LimitError) -> Self {
        StorageError::TooManyRequests(err.to_string())
    }
}

/// Semaphore-based limiter for one request kind
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    kind: &'static str,
    semaphore: Arc<Semaphore>,
    limit: usize,
    max_queue_duration: Duration,
    rejected: AtomicU64,
}

/// Slot held for the lifetime of one request
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(kind: &'static str, limit: usize, max_queue_duration: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            kind,
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            max_queue_duration,
            rejected: AtomicU64::new(0),
        }
    }

    /// Wait for a free slot, at most `max_queue_duration`
    pub async fn acquire(&self) -> Result<LimiterPermit, LimitError> {
        // Fast path without arming a timer
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(LimiterPermit { _permit: permit });
        }
        match tokio::time::timeout(
            self.max_queue_duration,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(LimiterPermit { _permit: permit }),
            // The semaphore is never closed; treat it like a timeout anyway
            Ok(Err(_)) | Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(LimitError {
                    kind: self.kind,
                    limit: self.limit,
                    waited: self.max_queue_duration,
                })
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently in use
    pub fn in_use(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Requests rejected so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn max_queue_duration(&self) -> Duration {
        self.max_queue_duration
    }
}
