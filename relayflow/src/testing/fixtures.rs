//! Fixtures and a wired-up harness for saga tests.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::mocks::{ScriptedEnrichment, ScriptedIssueTracker, ScriptedTaskManager};
use crate::config::{QueueConfig, RecoveryConfig, RelayConfig, TimeoutConfig};
use crate::errors::Result;
use crate::events::CollectingEventSink;
use crate::providers::SubmissionInput;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use crate::saga::{IntakeRequest, Orchestrator};
use crate::utils::{ManualClock, Timestamp};

/// Operator secret configured by [`fast_config`].
pub const TEST_OPERATOR_SECRET: &str = "test-operator-secret";

/// A representative security report.
#[must_use]
pub fn security_submission() -> SubmissionInput {
    SubmissionInput::new("Stored XSS in profile bio", "critical", "security")
        .with_description("The bio field renders unescaped HTML on the public profile page.")
        .with_reporter("researcher@example.test")
}

/// A minimal low-severity report without a description.
#[must_use]
pub fn minor_submission() -> SubmissionInput {
    SubmissionInput::new("Typo in footer", "low", "content")
}

/// An intake request for `input` from `identity`.
#[must_use]
pub fn intake(identity: &str, input: SubmissionInput) -> IntakeRequest {
    IntakeRequest::new(identity, input)
}

/// Configuration with short backoff and deadlines for paused-time tests.
///
/// Retries: 3 with 10 ms base and 40 ms cap. Deadlines: 1 s. Breaker:
/// defaults (5 failures, 60 s cooldown). Recovery back-off disabled.
#[must_use]
pub fn fast_config() -> RelayConfig {
    RelayConfig {
        rate_limit: RateLimitConfig::default(),
        circuit_breaker: CircuitBreakerConfig::default(),
        retry: RetryConfig::new()
            .with_base_delay_ms(10)
            .with_max_delay_ms(40),
        queue: QueueConfig::default(),
        timeouts: TimeoutConfig::default()
            .with_deadlines(Duration::from_secs(1), Duration::from_secs(1)),
        recovery: RecoveryConfig::default().with_min_retry_interval(Duration::ZERO),
        ..RelayConfig::default()
    }
    .with_operator_secret(TEST_OPERATOR_SECRET)
}

/// Fixed start instant for manual clocks.
#[must_use]
pub fn epoch() -> Timestamp {
    Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// An orchestrator wired to scripted providers, a manual clock and a
/// collecting event sink.
#[derive(Debug)]
pub struct RelayHarness {
    /// The orchestrator under test.
    pub orchestrator: Orchestrator,
    /// Scripted enrichment provider.
    pub enrichment: Arc<ScriptedEnrichment>,
    /// Scripted issue tracker.
    pub issues: Arc<ScriptedIssueTracker>,
    /// Scripted task manager.
    pub tasks: Arc<ScriptedTaskManager>,
    /// Clock shared by every component.
    pub clock: ManualClock,
    /// Every emitted event.
    pub events: Arc<CollectingEventSink>,
}

impl RelayHarness {
    /// Builds a harness with always-succeeding providers.
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::with_providers(
            config,
            ScriptedEnrichment::new(),
            ScriptedIssueTracker::new(),
            ScriptedTaskManager::new(),
        )
    }

    /// Builds a harness around the given providers.
    pub fn with_providers(
        config: RelayConfig,
        enrichment: ScriptedEnrichment,
        issues: ScriptedIssueTracker,
        tasks: ScriptedTaskManager,
    ) -> Result<Self> {
        let enrichment = Arc::new(enrichment);
        let issues = Arc::new(issues);
        let tasks = Arc::new(tasks);
        let clock = ManualClock::new(epoch());
        let events = Arc::new(CollectingEventSink::new());

        let orchestrator = Orchestrator::builder(config)
            .enrichment(enrichment.clone())
            .issue_tracker(issues.clone())
            .task_manager(tasks.clone())
            .clock(Arc::new(clock.clone()))
            .event_sink(events.clone())
            .build()?;

        Ok(Self {
            orchestrator,
            enrichment,
            issues,
            tasks,
            clock,
            events,
        })
    }
}
