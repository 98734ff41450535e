//! Saga orchestration and recovery.
//!
//! [`Orchestrator::submit`] runs enrich, create-issue and create-task for
//! one submission. [`RecoverySweep::run`] later resumes incomplete
//! submissions from the queue, and [`OperatorGate`] puts the sweep behind
//! a shared secret.

mod operator;
mod orchestrator;
mod recovery;
mod runner;
mod types;

pub use operator::OperatorGate;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use recovery::RecoverySweep;
pub use types::{IntakeRequest, IntakeResponse, RecoveryReport, StageReport};
