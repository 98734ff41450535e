//! Recovery sweep over queued submissions.
//!
//! Each pass re-executes only the delivery stages a record has not yet
//! completed, so a provider call that already succeeded is never repeated.

use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::runner::StageRunner;
use super::types::RecoveryReport;
use crate::config::RecoveryConfig;
use crate::core::SagaStage;
use crate::errors::{RelayError, Result};
use crate::events::{names, EventSink};
use crate::queue::{RecordUpdate, SubmissionRecord, SubmissionStore};
use crate::utils::{duration_between, Clock, Timestamp};

/// Re-attempts failed delivery stages of queued submissions.
pub struct RecoverySweep {
    config: RecoveryConfig,
    runner: Arc<StageRunner>,
    store: Arc<dyn SubmissionStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    running: Mutex<()>,
}

impl fmt::Debug for RecoverySweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverySweep")
            .field("config", &self.config)
            .field("running", &self.running.try_lock().is_err())
            .finish_non_exhaustive()
    }
}

impl RecoverySweep {
    pub(crate) fn new(
        config: RecoveryConfig,
        runner: Arc<StageRunner>,
        store: Arc<dyn SubmissionStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            runner,
            store,
            clock,
            events,
            running: Mutex::new(()),
        }
    }

    /// Runs one pass over every retryable record.
    ///
    /// Returns `SweepInProgress` immediately if another pass is running.
    /// Records attempted less than `min_retry_interval` ago are skipped.
    pub async fn run(&self) -> Result<Vec<RecoveryReport>> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| RelayError::SweepInProgress)?;

        let now = self.clock.now();
        let candidates = self.store.list_retryable().await;
        info!(candidates = candidates.len(), "Recovery sweep started");
        self.events
            .emit(
                names::RECOVERY_STARTED,
                Some(json!({ "candidates": candidates.len() })),
            )
            .await;

        let mut reports = Vec::new();
        for record in candidates {
            if self.resting(&record, now) {
                debug!(submission_id = %record.id, "Skipping recently attempted record");
                continue;
            }

            match self.store.mark_retry_attempted(record.id).await {
                Ok(true) => {}
                Ok(false) => {
                    self.ceiling_reached(record.id).await;
                    continue;
                }
                Err(err) => {
                    debug!(submission_id = %record.id, error = %err, "Record vanished before attempt");
                    continue;
                }
            }

            let claim = Claim::new(Arc::clone(&self.store), Arc::clone(&self.events), record.id);
            reports.push(self.attempt(record).await);
            claim.settle();
        }

        let resolved = reports.iter().filter(|r| r.success).count();
        info!(
            attempted = reports.len(),
            resolved,
            "Recovery sweep finished"
        );
        self.events
            .emit(
                names::RECOVERY_FINISHED,
                Some(json!({ "attempted": reports.len(), "resolved": resolved })),
            )
            .await;

        Ok(reports)
    }

    fn resting(&self, record: &SubmissionRecord, now: Timestamp) -> bool {
        let interval = self.config.min_retry_interval();
        if interval.is_zero() {
            return false;
        }
        record
            .last_attempt_at
            .is_some_and(|last| duration_between(last, now) < interval)
    }

    async fn attempt(&self, record: SubmissionRecord) -> RecoveryReport {
        let id = record.id;
        let mut update = RecordUpdate::new();
        let mut retried_stages = Vec::new();
        let mut local_errors = std::collections::BTreeMap::new();
        let mut issue_url = record.issue_url().map(str::to_owned);

        for stage in record.pending_stages() {
            retried_stages.push(stage);
            let run = match stage {
                SagaStage::Issue => {
                    self.runner
                        .create_issue(id, &record.input, &record.payload)
                        .await
                }
                SagaStage::Task => {
                    self.runner
                        .create_task(id, &record.input, &record.payload, issue_url.as_deref())
                        .await
                }
                SagaStage::Enrichment => continue,
            };

            update = match run.result {
                Ok(reference) => {
                    if stage == SagaStage::Issue {
                        issue_url = Some(reference.url.clone());
                    }
                    update.success(stage, reference)
                }
                Err(err) => {
                    local_errors.insert(stage, err.to_string());
                    update.error(stage, err.to_string())
                }
            };
        }

        let (success, remaining_errors) = match self.store.update(id, update).await {
            Ok(updated) if updated.is_complete() => {
                self.store.remove(id).await;
                (true, updated.errors)
            }
            Ok(updated) => {
                if !updated.has_retries_left() {
                    self.ceiling_reached(id).await;
                }
                (false, updated.errors)
            }
            Err(err) => {
                warn!(submission_id = %id, error = %err, "Could not write back recovery outcome");
                (local_errors.is_empty(), local_errors)
            }
        };

        if success {
            info!(submission_id = %id, retried = ?retried_stages, "Queued submission resolved");
            self.events
                .emit(names::RECOVERY_RECORD_RESOLVED, Some(json!({ "id": id })))
                .await;
        } else {
            info!(
                submission_id = %id,
                failing = remaining_errors.len(),
                "Queued submission still incomplete"
            );
            self.events
                .emit(
                    names::RECOVERY_RECORD_PENDING,
                    Some(json!({ "id": id, "errors": remaining_errors })),
                )
                .await;
        }

        RecoveryReport {
            id,
            success,
            retried_stages,
            remaining_errors,
        }
    }

    async fn ceiling_reached(&self, id: Uuid) {
        let err = RelayError::RetryCeilingReached { id };
        warn!(submission_id = %id, error = %err, "Queued submission needs operator attention");
        self.events
            .emit(
                names::RECOVERY_RECORD_EXHAUSTED,
                Some(json!({ "id": id, "code": err.code(), "error": err.to_string() })),
            )
            .await;
    }
}

/// A record claimed by `mark_retry_attempted`.
///
/// If the sweep future is dropped before the outcome is written back, the
/// claim is released on drop so the record becomes retryable again instead
/// of staying in flight.
struct Claim {
    store: Arc<dyn SubmissionStore>,
    events: Arc<dyn EventSink>,
    id: Uuid,
    settled: bool,
}

impl Claim {
    fn new(store: Arc<dyn SubmissionStore>, events: Arc<dyn EventSink>, id: Uuid) -> Self {
        Self {
            store,
            events,
            id,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let id = self.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(submission_id = %id, "Recovery attempt dropped outside a runtime, record left in flight");
            return;
        };

        warn!(submission_id = %id, "Recovery attempt cancelled, releasing record");
        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        runtime.spawn(async move {
            match store.update(id, RecordUpdate::new()).await {
                Ok(_) => {
                    events.try_emit(names::RECOVERY_CLAIM_RELEASED, Some(json!({ "id": id })));
                }
                Err(err) => {
                    debug!(submission_id = %id, error = %err, "Cancelled record already gone");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::errors::ProviderError;
    use crate::queue::SubmissionStatus;
    use crate::testing::{
        fast_config, intake, minor_submission, security_submission, RelayHarness,
        ScriptedEnrichment, ScriptedIssueTracker, ScriptedTaskManager, TEST_OPERATOR_SECRET,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn outage(provider: &str) -> ProviderError {
        ProviderError::http(provider, 503, "service unavailable")
    }

    fn harness_with_failing(issue: bool, task: bool) -> RelayHarness {
        let issues = if issue {
            ScriptedIssueTracker::failing(outage("issue_tracker"))
        } else {
            ScriptedIssueTracker::new()
        };
        let tasks = if task {
            ScriptedTaskManager::failing(outage("task_manager"))
        } else {
            ScriptedTaskManager::new()
        };
        RelayHarness::with_providers(fast_config(), ScriptedEnrichment::new(), issues, tasks)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_resumes_only_failed_stage() {
        let harness = harness_with_failing(true, false);
        let response = harness
            .orchestrator
            .submit(intake("a", security_submission()))
            .await
            .unwrap();
        let queue_id = response.queue_id.unwrap();
        assert_eq!(harness.tasks.calls(), 1);

        harness.issues.recover();
        let reports = harness.orchestrator.recovery().run().await.unwrap();

        assert_eq!(
            reports,
            vec![RecoveryReport {
                id: queue_id,
                success: true,
                retried_stages: vec![SagaStage::Issue],
                remaining_errors: std::collections::BTreeMap::new(),
            }]
        );
        assert_eq!(harness.tasks.calls(), 1, "task provider must not be called again");
        assert!(harness.orchestrator.store().get(queue_id).await.is_none());
        assert_eq!(harness.events.count(names::RECOVERY_RECORD_RESOLVED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_sweeps_are_idempotent() {
        let harness = harness_with_failing(true, false);
        harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        harness.issues.recover();
        let sweep = harness.orchestrator.recovery();

        let first = sweep.run().await.unwrap();
        let issue_calls = harness.issues.calls();
        let second = sweep.run().await.unwrap();
        let third = sweep.run().await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(third.is_empty());
        assert_eq!(harness.issues.calls(), issue_calls);
        assert_eq!(harness.tasks.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_retry_reuses_stored_issue_url() {
        let harness = harness_with_failing(false, true);
        harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        harness.tasks.recover();

        let reports = harness.orchestrator.recovery().run().await.unwrap();

        assert!(reports[0].success);
        assert_eq!(reports[0].retried_stages, vec![SagaStage::Task]);
        assert_eq!(harness.issues.calls(), 1);
        let urls = harness.tasks.issue_urls();
        assert_eq!(
            urls.last().cloned().flatten().as_deref(),
            Some("https://issues.example.test/ISSUE-1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_failing_record_is_written_back() {
        let harness = harness_with_failing(true, true);
        let response = harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        let queue_id = response.queue_id.unwrap();
        harness.tasks.recover();

        let reports = harness.orchestrator.recovery().run().await.unwrap();

        assert!(!reports[0].success);
        assert_eq!(reports[0].retried_stages, vec![SagaStage::Issue, SagaStage::Task]);
        assert_eq!(
            reports[0].remaining_errors.keys().copied().collect::<Vec<_>>(),
            vec![SagaStage::Issue]
        );

        let record = harness.orchestrator.store().get(queue_id).await.unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(!record.attempt_in_flight);
        assert_eq!(record.status(), SubmissionStatus::Partial);
        assert_eq!(harness.events.count(names::RECOVERY_RECORD_PENDING), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_success_record_fails_at_ceiling() {
        let harness = harness_with_failing(true, true);
        let response = harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        let queue_id = response.queue_id.unwrap();
        let sweep = harness.orchestrator.recovery();

        for _ in 0..3 {
            assert_eq!(sweep.run().await.unwrap().len(), 1);
        }
        assert!(sweep.run().await.unwrap().is_empty());

        let record = harness.orchestrator.store().get(queue_id).await.unwrap();
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.status(), SubmissionStatus::Failed);
        assert_eq!(harness.events.count(names::RECOVERY_RECORD_EXHAUSTED), 1);

        assert_eq!(harness.orchestrator.store().purge_expired().await, 1);
        assert!(harness.orchestrator.store().get(queue_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_attempted_records_rest() {
        let mut config = fast_config();
        config.recovery = RecoveryConfig::default().with_min_retry_interval(Duration::from_secs(60));
        let harness = RelayHarness::with_providers(
            config,
            ScriptedEnrichment::new(),
            ScriptedIssueTracker::failing(outage("issue_tracker")),
            ScriptedTaskManager::new(),
        )
        .unwrap();
        harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        let sweep = harness.orchestrator.recovery();

        assert_eq!(sweep.run().await.unwrap().len(), 1);
        harness.clock.advance(Duration::from_secs(30));
        assert!(sweep.run().await.unwrap().is_empty());
        harness.clock.advance(Duration::from_secs(30));
        assert_eq!(sweep.run().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sweep_is_rejected() {
        let harness = harness_with_failing(true, false);
        harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        harness.issues.recover();
        harness.issues.set_delay(Duration::from_millis(500));

        let sweep = harness.orchestrator.recovery();
        let background = tokio::spawn({
            let sweep = Arc::clone(&sweep);
            async move { sweep.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = sweep.run().await.unwrap_err();
        assert!(matches!(err, RelayError::SweepInProgress));

        let reports = background.await.unwrap().unwrap();
        assert!(reports[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sweep_releases_record() {
        let harness = harness_with_failing(true, false);
        let response = harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        let queue_id = response.queue_id.unwrap();
        harness.issues.recover();
        harness.issues.set_delay(Duration::from_millis(500));

        let sweep = harness.orchestrator.recovery();
        let background = tokio::spawn({
            let sweep = Arc::clone(&sweep);
            async move { sweep.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        background.abort();
        assert!(background.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let record = harness.orchestrator.store().get(queue_id).await.unwrap();
        assert!(!record.attempt_in_flight);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.status(), SubmissionStatus::Partial);
        assert_eq!(harness.events.count(names::RECOVERY_CLAIM_RELEASED), 1);

        harness.issues.set_delay(Duration::ZERO);
        let reports = sweep.run().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].success);
        assert!(harness.orchestrator.store().get(queue_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_gate() {
        let harness = harness_with_failing(true, false);
        harness
            .orchestrator
            .submit(intake("a", minor_submission()))
            .await
            .unwrap();
        harness.issues.recover();
        let gate = harness.orchestrator.operator_gate();

        assert!(matches!(
            gate.trigger_recovery(Some("guess")).await,
            Err(RelayError::Unauthorized)
        ));
        assert!(matches!(
            gate.trigger_recovery(None).await,
            Err(RelayError::Unauthorized)
        ));
        assert_eq!(harness.issues.calls(), 4);

        let reports = gate.trigger_recovery(Some(TEST_OPERATOR_SECRET)).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(gate.fingerprint().is_some());
    }

    #[tokio::test]
    async fn test_gate_without_secret_refuses_everything() {
        let mut config = fast_config();
        config.operator_secret = None;
        let harness = RelayHarness::new(config).unwrap();
        let gate = harness.orchestrator.operator_gate();

        assert!(gate.fingerprint().is_none());
        assert!(matches!(
            gate.trigger_recovery(Some(TEST_OPERATOR_SECRET)).await,
            Err(RelayError::Unauthorized)
        ));
    }
}
