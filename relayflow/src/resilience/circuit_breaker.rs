//! Per-service circuit breakers.
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls fail fast until `opened_until`
//! - Half-Open: calls pass through as probes; enough consecutive
//!   successes close the circuit, any failure re-opens it
//!
//! Open → Half-Open is recomputed lazily whenever a record is read, so no
//! background timer exists.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::CircuitOpenError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::utils::{ceil_secs, duration_between, system_clock, to_chrono, Clock, Timestamp};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Failing fast.
    Open,
    /// Probing for recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds, shared by every circuit in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit rejects calls.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_half_open_success_threshold() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            half_open_success_threshold: default_half_open_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a new config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown, rounded up to whole seconds.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_secs = ceil_secs(cooldown);
        self
    }

    /// Sets the half-open success threshold.
    #[must_use]
    pub fn with_half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.half_open_success_threshold = threshold;
        self
    }

    /// Gets the cooldown as a Duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// State machine for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitRecord {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successes since entering half-open.
    pub consecutive_successes: u32,
    /// When an open circuit starts admitting probes.
    pub opened_until: Option<Timestamp>,
}

impl CircuitRecord {
    /// Applies time-driven transitions. Returns true if the state changed.
    pub fn recompute(&mut self, now: Timestamp) -> bool {
        if self.state == CircuitState::Open && self.opened_until.map_or(true, |until| now >= until) {
            self.state = CircuitState::HalfOpen;
            self.consecutive_successes = 0;
            return true;
        }
        false
    }

    /// Applies a success. Returns the new state if it changed.
    pub fn on_success(&mut self, config: &CircuitBreakerConfig) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= config.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_until = None;
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => None,
        }
    }

    /// Applies a failure. Returns the new state if it changed.
    pub fn on_failure(
        &mut self,
        now: Timestamp,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;

        match self.state {
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold => {
                self.trip(now, config);
                Some(CircuitState::Open)
            }
            CircuitState::HalfOpen => {
                self.trip(now, config);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Time left before an open circuit admits a probe.
    #[must_use]
    pub fn retry_in(&self, now: Timestamp) -> Duration {
        match (self.state, self.opened_until) {
            (CircuitState::Open, Some(until)) => duration_between(now, until),
            _ => Duration::ZERO,
        }
    }

    fn trip(&mut self, now: Timestamp, config: &CircuitBreakerConfig) {
        self.state = CircuitState::Open;
        self.opened_until = Some(now + to_chrono(config.cooldown()));
    }
}

/// Snapshot of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
    /// Service key.
    pub service: String,
    /// State at snapshot time.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successes since entering half-open.
    pub consecutive_successes: u32,
    /// When an open circuit starts admitting probes.
    pub opened_until: Option<Timestamp>,
    /// Whole seconds until a probe is admitted, when open.
    pub retry_in_secs: Option<u64>,
}

impl CircuitStatus {
    fn from_record(service: &str, record: &CircuitRecord, now: Timestamp) -> Self {
        Self {
            service: service.to_string(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            consecutive_successes: record.consecutive_successes,
            opened_until: record.opened_until,
            retry_in_secs: (record.state == CircuitState::Open)
                .then(|| ceil_secs(record.retry_in(now))),
        }
    }
}

/// Registry of independent circuits keyed by service name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitRecord>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// Creates a registry reading the system clock.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a registry with an injected clock.
    #[must_use]
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            clock,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the sink that receives circuit transition events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns true if a call to `service` may proceed now.
    pub fn can_proceed(&self, service: &str) -> bool {
        self.can_proceed_at(service, self.clock.now())
    }

    /// [`Self::can_proceed`] at an explicit instant.
    pub fn can_proceed_at(&self, service: &str, now: Timestamp) -> bool {
        self.check_at(service, now).is_ok()
    }

    /// Records a successful call.
    pub fn record_success(&self, service: &str) {
        self.record_success_at(service, self.clock.now());
    }

    /// [`Self::record_success`] at an explicit instant.
    pub fn record_success_at(&self, service: &str, now: Timestamp) {
        let (probing, transition) = {
            let mut record = self.circuits.entry(service.to_string()).or_default();
            (record.recompute(now), record.on_success(&self.config))
        };
        self.announce_all(service, probing, transition, now);
    }

    /// Records a failed call.
    pub fn record_failure(&self, service: &str) {
        self.record_failure_at(service, self.clock.now());
    }

    /// [`Self::record_failure`] at an explicit instant.
    pub fn record_failure_at(&self, service: &str, now: Timestamp) {
        let (probing, transition) = {
            let mut record = self.circuits.entry(service.to_string()).or_default();
            (record.recompute(now), record.on_failure(now, &self.config))
        };
        self.announce_all(service, probing, transition, now);
    }

    /// Returns a snapshot of one circuit.
    pub fn status(&self, service: &str) -> CircuitStatus {
        self.status_at(service, self.clock.now())
    }

    /// [`Self::status`] at an explicit instant.
    pub fn status_at(&self, service: &str, now: Timestamp) -> CircuitStatus {
        let mut record = self.circuits.entry(service.to_string()).or_default();
        record.recompute(now);
        CircuitStatus::from_record(service, &record, now)
    }

    /// Returns snapshots of every known circuit, sorted by service.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let now = self.clock.now();
        let mut statuses: Vec<CircuitStatus> = self
            .circuits
            .iter_mut()
            .map(|mut entry| {
                entry.value_mut().recompute(now);
                CircuitStatus::from_record(entry.key(), entry.value(), now)
            })
            .collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Forces a circuit back to closed.
    pub fn reset(&self, service: &str) {
        self.circuits.insert(service.to_string(), CircuitRecord::default());
        info!(service, "Circuit reset by operator");
    }

    /// Runs `f` through the circuit for `service`.
    ///
    /// Fails fast with [`CircuitOpenError`] without invoking `f` while the
    /// circuit is open. Otherwise invokes `f`, records its outcome and
    /// returns its result unchanged.
    pub async fn run<T, E, F, Fut>(&self, service: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        if let Err(open) = self.check_at(service, self.clock.now()) {
            debug!(service, retry_in_secs = open.retry_in_secs, "Circuit open, failing fast");
            return Err(E::from(open));
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(service),
            Err(_) => self.record_failure(service),
        }
        result
    }

    fn check_at(&self, service: &str, now: Timestamp) -> Result<(), CircuitOpenError> {
        let (changed, record) = {
            let mut record = self.circuits.entry(service.to_string()).or_default();
            let changed = record.recompute(now);
            (changed, record.clone())
        };
        if changed {
            self.announce(service, record.state, now);
        }

        match record.state {
            CircuitState::Open => Err(CircuitOpenError::new(service, record.retry_in(now))),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    fn announce_all(
        &self,
        service: &str,
        probing: bool,
        transition: Option<CircuitState>,
        now: Timestamp,
    ) {
        if probing {
            self.announce(service, CircuitState::HalfOpen, now);
        }
        if let Some(state) = transition {
            self.announce(service, state, now);
        }
    }

    fn announce(&self, service: &str, state: CircuitState, now: Timestamp) {
        match state {
            CircuitState::Open => {
                warn!(
                    service,
                    cooldown_secs = self.config.cooldown_secs,
                    "Circuit opened"
                );
                self.events.try_emit(
                    names::CIRCUIT_OPENED,
                    Some(serde_json::json!({
                        "service": service,
                        "opened_until": now + to_chrono(self.config.cooldown()),
                    })),
                );
            }
            CircuitState::HalfOpen => {
                info!(service, "Circuit half-open, admitting probes");
                self.events.try_emit(
                    names::CIRCUIT_HALF_OPEN,
                    Some(serde_json::json!({ "service": service })),
                );
            }
            CircuitState::Closed => {
                info!(service, "Circuit closed");
                self.events.try_emit(
                    names::CIRCUIT_CLOSED,
                    Some(serde_json::json!({ "service": service })),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn epoch() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn registry(clock: &ManualClock) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::with_clock(CircuitBreakerConfig::default(), Arc::new(clock.clone()))
    }

    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown(), Duration::from_secs(60));
        assert_eq!(config.half_open_success_threshold, 2);
    }

    #[test]
    fn test_fractional_cooldown_rounds_up() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cooldown(Duration::from_millis(200));
        assert_eq!(config.cooldown(), Duration::from_secs(1));

        let clock = ManualClock::new(epoch());
        let breakers = CircuitBreakerRegistry::with_clock(config, Arc::new(clock.clone()));
        breakers.record_failure("task_manager");
        assert!(!breakers.can_proceed("task_manager"));
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        for _ in 0..4 {
            breakers.record_failure("issue_tracker");
            assert!(breakers.can_proceed("issue_tracker"));
        }
        breakers.record_failure("issue_tracker");

        assert!(!breakers.can_proceed("issue_tracker"));
        let status = breakers.status("issue_tracker");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.opened_until, Some(epoch() + chrono::Duration::seconds(60)));
        assert_eq!(status.retry_in_secs, Some(60));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        for _ in 0..4 {
            breakers.record_failure("svc");
        }
        breakers.record_success("svc");
        assert_eq!(breakers.status("svc").consecutive_failures, 0);

        for _ in 0..4 {
            breakers.record_failure("svc");
        }
        assert_eq!(breakers.status("svc").state, CircuitState::Closed);
    }

    #[test]
    fn test_open_becomes_half_open_lazily() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        clock.advance(Duration::from_secs(59));
        assert!(!breakers.can_proceed("svc"));

        clock.advance(Duration::from_secs(1));
        assert!(breakers.can_proceed("svc"));
        assert_eq!(breakers.status("svc").state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_two_successes() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        clock.advance(Duration::from_secs(60));

        breakers.record_success("svc");
        assert_eq!(breakers.status("svc").state, CircuitState::HalfOpen);
        breakers.record_success("svc");

        let status = breakers.status("svc");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.consecutive_successes, 0);
        assert_eq!(status.opened_until, None);
    }

    #[test]
    fn test_half_open_failure_reopens_and_rearms() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        clock.advance(Duration::from_secs(61));
        breakers.record_success("svc");
        breakers.record_failure("svc");

        let status = breakers.status("svc");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(
            status.opened_until,
            Some(epoch() + chrono::Duration::seconds(61 + 60))
        );
    }

    #[test]
    fn test_services_are_independent() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        for _ in 0..5 {
            breakers.record_failure("issue_tracker");
        }
        assert!(!breakers.can_proceed("issue_tracker"));
        assert!(breakers.can_proceed("task_manager"));
    }

    #[tokio::test]
    async fn test_run_fails_fast_without_invoking() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);
        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        clock.advance(Duration::from_secs(15));

        let calls = AtomicUsize::new(0);
        let result: Result<u32, crate::errors::RelayError> = breakers
            .run("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "circuit open for svc, retry in 45s");
    }

    #[tokio::test]
    async fn test_run_records_outcome_and_propagates() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        let ok: Result<&str, crate::errors::RelayError> =
            breakers.run("svc", || async { Ok("created") }).await;
        assert_eq!(ok.unwrap(), "created");

        let err: Result<(), crate::errors::RelayError> = breakers
            .run("svc", || async {
                Err(crate::errors::RelayError::Validation("boom".into()))
            })
            .await;
        assert!(matches!(err, Err(crate::errors::RelayError::Validation(ref m)) if m == "boom"));
        assert_eq!(breakers.status("svc").consecutive_failures, 1);
    }

    #[test]
    fn test_transition_events() {
        let clock = ManualClock::new(epoch());
        let sink = Arc::new(CollectingEventSink::new());
        let breakers = registry(&clock).with_event_sink(sink.clone());

        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        clock.advance(Duration::from_secs(60));
        assert!(breakers.can_proceed("svc"));
        breakers.record_success("svc");
        breakers.record_success("svc");

        let kinds: Vec<String> = sink.events().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec!["circuit.opened", "circuit.half_open", "circuit.closed"]);
    }

    #[test]
    fn test_statuses_and_reset() {
        let clock = ManualClock::new(epoch());
        let breakers = registry(&clock);

        breakers.record_failure("task_manager");
        for _ in 0..5 {
            breakers.record_failure("issue_tracker");
        }

        let statuses = breakers.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].service, "issue_tracker");
        assert_eq!(statuses[0].state, CircuitState::Open);

        breakers.reset("issue_tracker");
        assert!(breakers.can_proceed("issue_tracker"));
    }
}
