//! Submission store trait and the in-memory implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::record::{NewSubmission, QueueStats, RecordUpdate, SubmissionRecord, SubmissionStatus};
use crate::config::QueueConfig;
use crate::errors::{RelayError, Result};
use crate::utils::{duration_between, generate_uuid_v7, system_clock, Clock, Timestamp};

/// Storage backend for incomplete submissions.
///
/// Every method is atomic with respect to a single record.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Queues a submission and returns its id.
    ///
    /// Fails with `QueueFull` at capacity.
    async fn enqueue(&self, submission: NewSubmission) -> Result<Uuid>;

    /// Returns a snapshot of a record.
    async fn get(&self, id: Uuid) -> Option<SubmissionRecord>;

    /// Records eligible for automatic recovery, oldest first.
    async fn list_retryable(&self) -> Vec<SubmissionRecord>;

    /// Merges stage outcomes into a record and clears its in-flight flag.
    async fn update(&self, id: Uuid, update: RecordUpdate) -> Result<SubmissionRecord>;

    /// Claims a recovery attempt.
    ///
    /// Returns `false`, leaving the count at the ceiling, when no attempts
    /// remain.
    async fn mark_retry_attempted(&self, id: Uuid) -> Result<bool>;

    /// Removes a record. Returns true if it existed.
    async fn remove(&self, id: Uuid) -> bool;

    /// Occupancy snapshot.
    async fn stats(&self) -> QueueStats;

    /// Purges expired and exhausted records now. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}

/// In-memory submission store.
///
/// State is volatile; a restart loses every queued record.
pub struct InMemorySubmissionStore {
    config: QueueConfig,
    records: Mutex<HashMap<Uuid, SubmissionRecord>>,
    last_sweep: Mutex<Option<Timestamp>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemorySubmissionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySubmissionStore")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl InMemorySubmissionStore {
    /// Creates a store reading the system clock.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a store reading the given clock.
    #[must_use]
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(None),
            clock,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn is_purgeable(&self, record: &SubmissionRecord, now: Timestamp) -> bool {
        let expired = duration_between(record.created_at, now) > self.config.max_age();
        let exhausted = !record.attempt_in_flight
            && !record.has_retries_left()
            && record.status() == SubmissionStatus::Failed;
        expired || exhausted
    }

    fn purge_at(&self, now: Timestamp) -> usize {
        *self.last_sweep.lock() = Some(now);

        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|id, record| {
            if !self.is_purgeable(record, now) {
                return true;
            }
            warn!(
                submission_id = %id,
                status = %record.status(),
                retry_count = record.retry_count,
                errors = ?record.errors,
                "Dropping queued submission"
            );
            false
        });
        let purged = before - records.len();
        drop(records);

        if purged > 0 {
            info!(purged, "Purged expired submission records");
        }
        purged
    }

    fn maybe_sweep(&self, now: Timestamp) {
        let due = match *self.last_sweep.lock() {
            None => true,
            Some(last) => duration_between(last, now) >= self.config.sweep_interval(),
        };
        if due {
            self.purge_at(now);
        }
    }
}

#[async_trait]
impl SubmissionStore for InMemorySubmissionStore {
    async fn enqueue(&self, submission: NewSubmission) -> Result<Uuid> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let mut records = self.records.lock();
        if records.len() >= self.config.capacity {
            warn!(capacity = self.config.capacity, "Submission queue full");
            return Err(RelayError::QueueFull {
                capacity: self.config.capacity,
            });
        }

        let id = generate_uuid_v7();
        let record = SubmissionRecord::from_new(id, submission, self.config.max_retries, now);
        debug!(submission_id = %id, status = %record.status(), "Queued submission");
        records.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Option<SubmissionRecord> {
        self.maybe_sweep(self.clock.now());
        self.records.lock().get(&id).cloned()
    }

    async fn list_retryable(&self) -> Vec<SubmissionRecord> {
        self.maybe_sweep(self.clock.now());

        let mut retryable: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|record| {
                matches!(
                    record.status(),
                    SubmissionStatus::Pending | SubmissionStatus::Partial
                ) && record.has_retries_left()
            })
            .cloned()
            .collect();

        retryable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        retryable
    }

    async fn update(&self, id: Uuid, update: RecordUpdate) -> Result<SubmissionRecord> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(RelayError::NotFound { id })?;
        update.apply(record, now);
        Ok(record.clone())
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(RelayError::NotFound { id })?;

        if !record.has_retries_left() {
            debug!(submission_id = %id, retry_count = record.retry_count, "Retry ceiling reached");
            return Ok(false);
        }

        record.retry_count += 1;
        record.attempt_in_flight = true;
        record.last_attempt_at = Some(now);
        record.updated_at = now;
        Ok(true)
    }

    async fn remove(&self, id: Uuid) -> bool {
        self.records.lock().remove(&id).is_some()
    }

    async fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let records = self.records.lock();
        let mut stats = QueueStats {
            capacity: self.config.capacity,
            ..QueueStats::default()
        };
        for record in records.values() {
            stats.count(record.status());
        }
        stats.oldest_age_secs = records
            .values()
            .map(|record| record.created_at)
            .min()
            .map(|oldest| duration_between(oldest, now).as_secs());
        stats
    }

    async fn purge_expired(&self) -> usize {
        self.purge_at(self.clock.now())
    }
}
