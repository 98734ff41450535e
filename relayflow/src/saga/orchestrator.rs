//! The submission saga: enrich, create issue, create task.
//!
//! Enrichment failure is absorbed by a local fallback. Issue and task
//! failures are recorded per stage without aborting each other, and any
//! submission that is not fully delivered is queued for the recovery sweep.

use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::operator::OperatorGate;
use super::recovery::RecoverySweep;
use super::runner::StageRunner;
use super::types::{IntakeRequest, IntakeResponse, StageReport};
use crate::config::RelayConfig;
use crate::core::{OutcomeStatus, SagaPhase, SagaStage, StageStatus};
use crate::errors::{RelayError, Result};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::providers::{EnrichedPayload, EnrichmentProvider, IssueTracker, TaskManager};
use crate::queue::{InMemorySubmissionStore, NewSubmission, SubmissionStore};
use crate::resilience::{CircuitBreakerRegistry, RateLimiter};
use crate::utils::{generate_uuid_v7, system_clock, Clock};

/// Coordinates one submission through the three provider stages.
pub struct Orchestrator {
    config: RelayConfig,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    store: Arc<dyn SubmissionStore>,
    runner: Arc<StageRunner>,
    events: Arc<dyn EventSink>,
    recovery: Arc<RecoverySweep>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder(config: RelayConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the admission gate.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Returns the circuit breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Returns the submission store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    /// Returns the recovery sweep sharing this orchestrator's providers.
    #[must_use]
    pub fn recovery(&self) -> Arc<RecoverySweep> {
        Arc::clone(&self.recovery)
    }

    /// Returns an operator gate guarding the recovery sweep.
    #[must_use]
    pub fn operator_gate(&self) -> OperatorGate {
        OperatorGate::new(self.config.operator_secret.as_deref(), self.recovery())
    }

    /// Runs a submission through the saga.
    ///
    /// Admission and validation failures are returned before any provider
    /// is called. Provider failures never fail the call; they are reported
    /// per stage and the submission is queued.
    pub async fn submit(&self, request: IntakeRequest) -> Result<IntakeResponse> {
        let decision = self.limiter.admit(&request.identity);
        if !decision.allowed {
            info!(
                identity = %request.identity,
                retry_after_secs = decision.retry_after_secs(),
                "Submission rejected by admission gate"
            );
            return Err(RelayError::AdmissionDenied(decision));
        }
        request.input.validate()?;

        let saga_id = generate_uuid_v7();
        let input = request.input;
        self.events
            .emit(
                names::SAGA_STARTED,
                Some(json!({
                    "saga_id": saga_id,
                    "category": input.category,
                    "severity": input.severity,
                })),
            )
            .await;
        self.enter(saga_id, SagaPhase::Received).await;

        // Stage 1: enrichment, never fatal.
        self.enter(saga_id, SagaPhase::Enriching).await;
        let enrichment = self.runner.enrich(saga_id, &input).await;
        let enrichment_report = enrichment.report(SagaStage::Enrichment, StageStatus::Succeeded, None);
        let (payload, enrichment_error) = match enrichment.result {
            Ok(payload) => (payload, None),
            Err(err) => {
                let degraded = RelayError::StageDegraded {
                    stage: SagaStage::Enrichment,
                    reason: err.to_string(),
                };
                warn!(saga_id = %saga_id, error = %degraded, "Using local enrichment fallback");
                self.events
                    .emit(
                        names::SAGA_ENRICHMENT_DEGRADED,
                        Some(json!({ "saga_id": saga_id, "reason": err.to_string() })),
                    )
                    .await;
                (EnrichedPayload::fallback(&input), Some(err.to_string()))
            }
        };

        // Stage 2: issue.
        self.enter(saga_id, SagaPhase::CreatingIssue).await;
        let issue = self.runner.create_issue(saga_id, &input, &payload).await;
        let issue_ref = issue.result.as_ref().ok().cloned();
        let issue_report = issue.report(SagaStage::Issue, StageStatus::Succeeded, issue_ref.clone());
        self.note_failure(saga_id, &issue_report).await;

        // Stage 3: task, linked to the issue when there is one.
        self.enter(saga_id, SagaPhase::CreatingTask).await;
        let issue_url = issue_ref.as_ref().map(|r| r.url.as_str());
        let task = self
            .runner
            .create_task(saga_id, &input, &payload, issue_url)
            .await;
        let task_ref = task.result.as_ref().ok().cloned();
        let task_report = task.report(SagaStage::Task, StageStatus::Succeeded, task_ref.clone());
        self.note_failure(saga_id, &task_report).await;

        self.enter(saga_id, SagaPhase::Aggregating).await;
        let delivered = usize::from(issue_ref.is_some()) + usize::from(task_ref.is_some());
        let status = OutcomeStatus::aggregate(delivered, SagaStage::DELIVERY.len());

        let queue_id = if status.is_complete() {
            None
        } else {
            let mut submission = NewSubmission::new(input.clone(), payload);
            if let Some(error) = enrichment_error.clone() {
                submission = submission.with_enrichment_error(error);
            }
            for report in [&issue_report, &task_report] {
                submission = match (&report.external_ref, &report.error) {
                    (Some(reference), _) => submission.with_success(report.stage, reference.clone()),
                    (None, Some(error)) => submission.with_error(report.stage, error.clone()),
                    (None, None) => submission,
                };
            }
            self.enqueue(saga_id, submission).await
        };

        if status == OutcomeStatus::Failed {
            error!(
                saga_id = %saga_id,
                queued = queue_id.is_some(),
                "No delivery stage succeeded"
            );
        }

        self.enter(saga_id, SagaPhase::Responding).await;
        let response = IntakeResponse {
            saga_id,
            status,
            issue_ref,
            task_ref,
            stages: vec![enrichment_report, issue_report, task_report],
            enrichment_degraded: enrichment_error.is_some(),
            queued: queue_id.is_some(),
            queue_id,
            rate_limit: decision,
        };

        info!(
            saga_id = %saga_id,
            status = %response.status,
            enrichment_degraded = response.enrichment_degraded,
            queued = response.queued,
            "Saga completed"
        );
        self.events
            .emit(
                names::SAGA_COMPLETED,
                Some(json!({
                    "saga_id": saga_id,
                    "status": response.status,
                    "queued": response.queued,
                })),
            )
            .await;

        Ok(response)
    }

    async fn enter(&self, saga_id: Uuid, phase: SagaPhase) {
        info!(saga_id = %saga_id, phase = %phase, "Saga phase");
        self.events
            .emit(names::SAGA_PHASE, Some(json!({ "saga_id": saga_id, "phase": phase })))
            .await;
    }

    async fn note_failure(&self, saga_id: Uuid, report: &StageReport) {
        if report.status != StageStatus::Failed {
            return;
        }
        warn!(
            saga_id = %saga_id,
            stage = %report.stage,
            attempts = report.attempts,
            error = report.error.as_deref().unwrap_or_default(),
            "Delivery stage failed"
        );
        self.events
            .emit(
                names::SAGA_STAGE_FAILED,
                Some(json!({
                    "saga_id": saga_id,
                    "stage": report.stage,
                    "code": report.error_code,
                    "error": report.error,
                })),
            )
            .await;
    }

    async fn enqueue(&self, saga_id: Uuid, submission: NewSubmission) -> Option<Uuid> {
        match self.store.enqueue(submission).await {
            Ok(id) => {
                info!(saga_id = %saga_id, queue_id = %id, "Queued incomplete submission");
                self.events
                    .emit(
                        names::QUEUE_ENQUEUED,
                        Some(json!({ "saga_id": saga_id, "queue_id": id })),
                    )
                    .await;
                Some(id)
            }
            Err(err) => {
                warn!(saga_id = %saga_id, error = %err, "Could not queue incomplete submission");
                if let RelayError::QueueFull { capacity } = err {
                    self.events
                        .emit(
                            names::QUEUE_FULL,
                            Some(json!({ "saga_id": saga_id, "capacity": capacity })),
                        )
                        .await;
                }
                None
            }
        }
    }
}

/// Builder for [`Orchestrator`].
///
/// All three providers are required. The clock, store and event sink
/// default to the system clock, an in-memory store and a no-op sink.
pub struct OrchestratorBuilder {
    config: RelayConfig,
    enrichment: Option<Arc<dyn EnrichmentProvider>>,
    issues: Option<Arc<dyn IssueTracker>>,
    tasks: Option<Arc<dyn TaskManager>>,
    store: Option<Arc<dyn SubmissionStore>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            enrichment: None,
            issues: None,
            tasks: None,
            store: None,
            clock: system_clock(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the enrichment provider.
    #[must_use]
    pub fn enrichment(mut self, provider: Arc<dyn EnrichmentProvider>) -> Self {
        self.enrichment = Some(provider);
        self
    }

    /// Sets the issue tracker.
    #[must_use]
    pub fn issue_tracker(mut self, provider: Arc<dyn IssueTracker>) -> Self {
        self.issues = Some(provider);
        self
    }

    /// Sets the task manager.
    #[must_use]
    pub fn task_manager(mut self, provider: Arc<dyn TaskManager>) -> Self {
        self.tasks = Some(provider);
        self
    }

    /// Replaces the default in-memory store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SubmissionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the clock shared by the limiter, breakers, store and sweep.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Validates the configuration and wires every component.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let missing = |what: &str| RelayError::Config(format!("{what} provider is required"));
        let enrichment = self.enrichment.ok_or_else(|| missing("enrichment"))?;
        let issues = self.issues.ok_or_else(|| missing("issue tracker"))?;
        let tasks = self.tasks.ok_or_else(|| missing("task manager"))?;

        let limiter = Arc::new(RateLimiter::with_clock(
            self.config.rate_limit.clone(),
            Arc::clone(&self.clock),
        ));
        let breakers = Arc::new(
            CircuitBreakerRegistry::with_clock(
                self.config.circuit_breaker.clone(),
                Arc::clone(&self.clock),
            )
            .with_event_sink(Arc::clone(&self.events)),
        );
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemorySubmissionStore::with_clock(
                self.config.queue.clone(),
                Arc::clone(&self.clock),
            ))
        });
        let runner = Arc::new(StageRunner::new(
            &self.config,
            Arc::clone(&breakers),
            enrichment,
            issues,
            tasks,
        ));
        let recovery = Arc::new(RecoverySweep::new(
            self.config.recovery.clone(),
            Arc::clone(&runner),
            Arc::clone(&store),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
        ));

        Ok(Orchestrator {
            config: self.config,
            limiter,
            breakers,
            store,
            runner,
            events: self.events,
            recovery,
        })
    }
}
