//! # Relayflow
//!
//! A resilient relay that takes a submission through three unreliable
//! external providers (AI enrichment, an issue tracker and a task manager)
//! without losing it and without repeating a provider call that already
//! succeeded.
//!
//! Relayflow provides:
//!
//! - **Admission control**: a sliding-window rate limiter keyed by caller identity
//! - **Circuit breaking**: one breaker per provider, with lazy half-open probing
//! - **Bounded retry**: exponential backoff without jitter, nested inside the breaker
//! - **Recoverable queue**: partial progress is kept so recovery resumes only failed stages
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relayflow::prelude::*;
//!
//! let orchestrator = Orchestrator::builder(RelayConfig::from_env()?)
//!     .enrichment(Arc::new(MyEnrichment::new()))
//!     .issue_tracker(Arc::new(MyTracker::new()))
//!     .task_manager(Arc::new(MyTasks::new()))
//!     .build()?;
//!
//! let response = orchestrator
//!     .submit(IntakeRequest::new(client_identity(forwarded_for, peer), input))
//!     .await?;
//!
//! // Later, from a scheduler or an operator endpoint:
//! let reports = orchestrator.recovery().run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod providers;
pub mod queue;
pub mod resilience;
pub mod saga;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        ConfigError, QueueConfig, RecoveryConfig, RelayConfig, TimeoutConfig,
    };
    pub use crate::core::{OutcomeStatus, SagaPhase, SagaStage, StageStatus};
    pub use crate::errors::{
        CircuitOpenError, ProviderError, ProviderErrorKind, RelayError, Result,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::providers::{
        EnrichedPayload, EnrichmentProvider, ExternalRef, IssueTracker, Priority,
        SubmissionInput, TaskManager,
    };
    pub use crate::queue::{
        InMemorySubmissionStore, QueueStats, SubmissionRecord, SubmissionStatus,
        SubmissionStore,
    };
    pub use crate::resilience::{
        client_identity, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
        RateLimitConfig, RateLimitDecision, RateLimiter, RetryConfig,
    };
    pub use crate::saga::{
        IntakeRequest, IntakeResponse, OperatorGate, Orchestrator, RecoveryReport,
        RecoverySweep, StageReport,
    };
    pub use crate::utils::{Clock, ManualClock, SystemClock, Timestamp};
}
