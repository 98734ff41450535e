//! Guarded provider calls shared by the saga and the recovery sweep.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::types::StageReport;
use crate::config::{RelayConfig, TimeoutConfig};
use crate::core::{SagaStage, StageStatus};
use crate::errors::{ProviderError, RelayError};
use crate::observability::{stage_span, SpanTimer};
use crate::providers::{
    with_deadline, EnrichedPayload, EnrichmentProvider, ExternalRef, IssueTracker,
    SubmissionInput, TaskManager,
};
use crate::resilience::{try_with_retry, CircuitBreakerRegistry, RetryConfig};

/// Outcome of one guarded stage execution.
#[derive(Debug)]
pub(crate) struct StageRun<T> {
    pub result: Result<T, RelayError>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl<T> StageRun<T> {
    /// Builds the stage report, with `status` used when the call succeeded.
    pub fn report(
        &self,
        stage: SagaStage,
        on_success: StageStatus,
        external_ref: Option<ExternalRef>,
    ) -> StageReport {
        let (status, error_code, error) = match &self.result {
            Ok(_) => (on_success, None, None),
            Err(err) => {
                let status = if stage.is_delivery() {
                    StageStatus::Failed
                } else {
                    StageStatus::Degraded
                };
                (status, Some(err.code().to_string()), Some(err.to_string()))
            }
        };

        StageReport {
            stage,
            status,
            attempts: self.attempts,
            duration_ms: self.duration_ms,
            error_code,
            error,
            external_ref,
        }
    }
}

/// Runs provider calls as `breaker(retry(deadline(call)))`.
pub(crate) struct StageRunner {
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
    enrichment: Arc<dyn EnrichmentProvider>,
    issues: Arc<dyn IssueTracker>,
    tasks: Arc<dyn TaskManager>,
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRunner")
            .field("retry", &self.retry)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    pub fn new(
        config: &RelayConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        enrichment: Arc<dyn EnrichmentProvider>,
        issues: Arc<dyn IssueTracker>,
        tasks: Arc<dyn TaskManager>,
    ) -> Self {
        Self {
            breakers,
            retry: config.retry.clone(),
            timeouts: config.timeouts.clone(),
            enrichment,
            issues,
            tasks,
        }
    }

    pub async fn enrich(&self, id: Uuid, input: &SubmissionInput) -> StageRun<EnrichedPayload> {
        self.guarded(SagaStage::Enrichment, id, self.timeouts.enrichment(), || {
            self.enrichment.enrich(input)
        })
        .await
    }

    pub async fn create_issue(
        &self,
        id: Uuid,
        input: &SubmissionInput,
        payload: &EnrichedPayload,
    ) -> StageRun<ExternalRef> {
        self.guarded(SagaStage::Issue, id, self.timeouts.delivery(), || {
            self.issues.create_issue(input, payload)
        })
        .await
    }

    pub async fn create_task(
        &self,
        id: Uuid,
        input: &SubmissionInput,
        payload: &EnrichedPayload,
        issue_url: Option<&str>,
    ) -> StageRun<ExternalRef> {
        self.guarded(SagaStage::Task, id, self.timeouts.delivery(), || {
            self.tasks.create_task(input, payload, issue_url)
        })
        .await
    }

    async fn guarded<T, F, Fut>(
        &self,
        stage: SagaStage,
        id: Uuid,
        deadline: Duration,
        call: F,
    ) -> StageRun<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let service = stage.service_name();
        let timer = SpanTimer::start(stage.to_string());
        let call = &call;
        let retry = &self.retry;
        let attempts = &AtomicU32::new(0);

        let result = self
            .breakers
            .run(service, move || async move {
                let outcome = try_with_retry(
                    retry,
                    service,
                    |e: &ProviderError| e.is_retryable(),
                    || with_deadline(service, deadline, call()),
                )
                .await;
                attempts.store(outcome.attempts, Ordering::Relaxed);
                outcome.into_relay_result()
            })
            .instrument(stage_span(stage, id))
            .await;

        StageRun {
            result,
            attempts: attempts.load(Ordering::Relaxed),
            duration_ms: timer.finish(),
        }
    }
}
