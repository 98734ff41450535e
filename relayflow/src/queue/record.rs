//! Queued submission records.
//!
//! A record's status is never stored. It is derived from which delivery
//! stages have succeeded or failed, how many recovery attempts were made,
//! and whether an attempt is currently running.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::core::SagaStage;
use crate::providers::{EnrichedPayload, ExternalRef, SubmissionInput};
use crate::utils::Timestamp;

/// Derived lifecycle status of a queued submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Waiting for the next recovery attempt.
    Pending,
    /// A recovery attempt is running.
    Retrying,
    /// At least one delivery stage succeeded and at least one failed.
    Partial,
    /// Nothing was delivered and no automatic attempts remain.
    Failed,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Retrying => write!(f, "retrying"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A submission whose delivery is incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Record id (UUID v7).
    pub id: Uuid,
    /// The submission as received.
    pub input: SubmissionInput,
    /// Best available enriched payload.
    pub payload: EnrichedPayload,
    /// True if `payload` is the local fallback.
    pub enrichment_degraded: bool,
    /// Why enrichment failed, when it did.
    pub enrichment_error: Option<String>,
    /// Delivery stages that have succeeded.
    pub successes: BTreeSet<SagaStage>,
    /// Last error per failing delivery stage.
    pub errors: BTreeMap<SagaStage, String>,
    /// External references of delivered stages.
    pub refs: BTreeMap<SagaStage, ExternalRef>,
    /// Recovery attempts made so far.
    pub retry_count: u32,
    /// Recovery attempts allowed.
    pub max_retries: u32,
    /// True between `mark_retry_attempted` and the attempt's write-back.
    pub attempt_in_flight: bool,
    /// When the record was queued.
    pub created_at: Timestamp,
    /// Last modification.
    pub updated_at: Timestamp,
    /// Start of the most recent recovery attempt.
    pub last_attempt_at: Option<Timestamp>,
}

impl SubmissionRecord {
    pub(crate) fn from_new(
        id: Uuid,
        submission: NewSubmission,
        max_retries: u32,
        now: Timestamp,
    ) -> Self {
        let mut record = Self {
            id,
            input: submission.input,
            payload: submission.payload,
            enrichment_degraded: submission.enrichment_error.is_some(),
            enrichment_error: submission.enrichment_error,
            successes: BTreeSet::new(),
            errors: BTreeMap::new(),
            refs: BTreeMap::new(),
            retry_count: 0,
            max_retries,
            attempt_in_flight: false,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
        };
        record.merge(submission.outcomes);
        record
    }

    /// Derives the status.
    #[must_use]
    pub fn status(&self) -> SubmissionStatus {
        let delivered = self.success_count();
        let failing = SagaStage::DELIVERY
            .iter()
            .filter(|stage| self.errors.contains_key(*stage))
            .count();

        if delivered > 0 && failing > 0 {
            SubmissionStatus::Partial
        } else if delivered == 0 && self.retry_count >= self.max_retries {
            SubmissionStatus::Failed
        } else if self.attempt_in_flight {
            SubmissionStatus::Retrying
        } else {
            SubmissionStatus::Pending
        }
    }

    /// Number of delivery stages that succeeded.
    #[must_use]
    pub fn success_count(&self) -> usize {
        SagaStage::DELIVERY
            .iter()
            .filter(|stage| self.successes.contains(*stage))
            .count()
    }

    /// Delivery stages still to run, in execution order.
    #[must_use]
    pub fn pending_stages(&self) -> Vec<SagaStage> {
        SagaStage::DELIVERY
            .into_iter()
            .filter(|stage| !self.successes.contains(stage))
            .collect()
    }

    /// True once every delivery stage has succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending_stages().is_empty()
    }

    /// True while automatic recovery attempts remain.
    #[must_use]
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// URL of the created issue, if the issue stage succeeded.
    #[must_use]
    pub fn issue_url(&self) -> Option<&str> {
        self.refs.get(&SagaStage::Issue).map(|r| r.url.as_str())
    }

    pub(crate) fn merge(&mut self, outcomes: StageOutcomes) {
        for (stage, reference) in outcomes.successes {
            self.errors.remove(&stage);
            self.successes.insert(stage);
            self.refs.insert(stage, reference);
        }
        for (stage, error) in outcomes.errors {
            self.successes.remove(&stage);
            self.refs.remove(&stage);
            self.errors.insert(stage, error);
        }
    }
}

/// Per-stage outcomes carried by [`NewSubmission`] and [`RecordUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcomes {
    successes: BTreeMap<SagaStage, ExternalRef>,
    errors: BTreeMap<SagaStage, String>,
}

impl StageOutcomes {
    fn succeed(&mut self, stage: SagaStage, reference: ExternalRef) {
        self.errors.remove(&stage);
        self.successes.insert(stage, reference);
    }

    fn fail(&mut self, stage: SagaStage, error: String) {
        self.successes.remove(&stage);
        self.errors.insert(stage, error);
    }

    fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.errors.is_empty()
    }
}

/// Everything needed to queue an incomplete submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    /// The submission as received.
    pub input: SubmissionInput,
    /// Best available enriched payload.
    pub payload: EnrichedPayload,
    /// Why enrichment failed, when it did.
    pub enrichment_error: Option<String>,
    outcomes: StageOutcomes,
}

impl NewSubmission {
    /// Starts a submission with no stage outcomes.
    #[must_use]
    pub fn new(input: SubmissionInput, payload: EnrichedPayload) -> Self {
        Self {
            input,
            payload,
            enrichment_error: None,
            outcomes: StageOutcomes::default(),
        }
    }

    /// Records that enrichment fell back to the local payload.
    #[must_use]
    pub fn with_enrichment_error(mut self, error: impl Into<String>) -> Self {
        self.enrichment_error = Some(error.into());
        self
    }

    /// Records a delivered stage.
    #[must_use]
    pub fn with_success(mut self, stage: SagaStage, reference: ExternalRef) -> Self {
        self.outcomes.succeed(stage, reference);
        self
    }

    /// Records a failed stage.
    #[must_use]
    pub fn with_error(mut self, stage: SagaStage, error: impl Into<String>) -> Self {
        self.outcomes.fail(stage, error.into());
        self
    }
}

/// Changes written back after a recovery attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    outcomes: StageOutcomes,
    /// Replacement payload, if a better one became available.
    pub payload: Option<EnrichedPayload>,
}

impl RecordUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a stage delivered, clearing its error.
    #[must_use]
    pub fn success(mut self, stage: SagaStage, reference: ExternalRef) -> Self {
        self.outcomes.succeed(stage, reference);
        self
    }

    /// Marks a stage failed, clearing its success.
    #[must_use]
    pub fn error(mut self, stage: SagaStage, error: impl Into<String>) -> Self {
        self.outcomes.fail(stage, error.into());
        self
    }

    /// Replaces the stored payload.
    #[must_use]
    pub fn payload(mut self, payload: EnrichedPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// True if the update changes no stage outcome and no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.payload.is_none()
    }

    pub(crate) fn apply(self, record: &mut SubmissionRecord, now: Timestamp) {
        record.merge(self.outcomes);
        if let Some(payload) = self.payload {
            record.payload = payload;
        }
        record.attempt_in_flight = false;
        record.updated_at = now;
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Records currently queued.
    pub total: usize,
    /// Records in `Pending`.
    pub pending: usize,
    /// Records in `Retrying`.
    pub retrying: usize,
    /// Records in `Partial`.
    pub partial: usize,
    /// Records in `Failed`.
    pub failed: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Age of the oldest record in whole seconds.
    pub oldest_age_secs: Option<u64>,
}

impl QueueStats {
    pub(crate) fn count(&mut self, status: SubmissionStatus) {
        self.total += 1;
        match status {
            SubmissionStatus::Pending => self.pending += 1,
            SubmissionStatus::Retrying => self.retrying += 1,
            SubmissionStatus::Partial => self.partial += 1,
            SubmissionStatus::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn input() -> SubmissionInput {
        SubmissionInput::new("Login page leaks stack traces", "high", "security")
    }

    fn record(submission: NewSubmission, max_retries: u32) -> SubmissionRecord {
        SubmissionRecord::from_new(Uuid::nil(), submission, max_retries, t0())
    }

    fn issue_ref() -> ExternalRef {
        ExternalRef::new("SEC-1", "https://tracker.example/SEC-1")
    }

    #[test]
    fn test_partial_when_one_stage_succeeded_and_one_failed() {
        let payload = EnrichedPayload::fallback(&input());
        let rec = record(
            NewSubmission::new(input(), payload)
                .with_success(SagaStage::Issue, issue_ref())
                .with_error(SagaStage::Task, "task_manager failed (http 503): down"),
            3,
        );

        assert_eq!(rec.status(), SubmissionStatus::Partial);
        assert_eq!(rec.pending_stages(), vec![SagaStage::Task]);
        assert_eq!(rec.issue_url(), Some("https://tracker.example/SEC-1"));
    }

    #[test]
    fn test_zero_successes_is_pending_until_ceiling() {
        let payload = EnrichedPayload::fallback(&input());
        let mut rec = record(
            NewSubmission::new(input(), payload)
                .with_error(SagaStage::Issue, "down")
                .with_error(SagaStage::Task, "down"),
            2,
        );
        assert_eq!(rec.status(), SubmissionStatus::Pending);

        rec.attempt_in_flight = true;
        rec.retry_count = 1;
        assert_eq!(rec.status(), SubmissionStatus::Retrying);

        rec.retry_count = 2;
        assert_eq!(rec.status(), SubmissionStatus::Failed);
    }

    #[test]
    fn test_partial_wins_over_ceiling() {
        let payload = EnrichedPayload::fallback(&input());
        let mut rec = record(
            NewSubmission::new(input(), payload)
                .with_success(SagaStage::Issue, issue_ref())
                .with_error(SagaStage::Task, "down"),
            1,
        );
        rec.retry_count = 1;
        assert_eq!(rec.status(), SubmissionStatus::Partial);
    }

    #[test]
    fn test_update_success_clears_error_and_in_flight() {
        let payload = EnrichedPayload::fallback(&input());
        let mut rec = record(
            NewSubmission::new(input(), payload)
                .with_error(SagaStage::Issue, "down")
                .with_error(SagaStage::Task, "down"),
            3,
        );
        rec.attempt_in_flight = true;

        let later = t0() + chrono::Duration::minutes(5);
        RecordUpdate::new()
            .success(SagaStage::Issue, issue_ref())
            .error(SagaStage::Task, "still down")
            .apply(&mut rec, later);

        assert!(!rec.attempt_in_flight);
        assert_eq!(rec.updated_at, later);
        assert!(rec.successes.contains(&SagaStage::Issue));
        assert!(!rec.errors.contains_key(&SagaStage::Issue));
        assert_eq!(rec.errors.get(&SagaStage::Task).map(String::as_str), Some("still down"));
        assert_eq!(rec.status(), SubmissionStatus::Partial);
        assert!(!rec.is_complete());
    }

    #[test]
    fn test_enrichment_error_marks_degraded() {
        let payload = EnrichedPayload::fallback(&input());
        let rec = record(
            NewSubmission::new(input(), payload).with_enrichment_error("timeout"),
            3,
        );
        assert!(rec.enrichment_degraded);
        assert_eq!(rec.pending_stages(), SagaStage::DELIVERY.to_vec());
    }

    #[test]
    fn test_record_serializes_stage_keys_as_strings() {
        let payload = EnrichedPayload::fallback(&input());
        let rec = record(
            NewSubmission::new(input(), payload).with_success(SagaStage::Issue, issue_ref()),
            3,
        );
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["refs"]["issue"]["external_id"], "SEC-1");
        assert_eq!(json["successes"], serde_json::json!(["issue"]));
    }
}
