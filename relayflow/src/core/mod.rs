//! Core domain model types for relayflow.
//!
//! This module contains the enums shared by the saga controller, the
//! submission queue and the recovery sweep:
//! - Saga stages and their provider service keys
//! - Per-stage and aggregate outcome statuses
//! - Saga controller phases

mod status;

pub use status::{OutcomeStatus, SagaPhase, SagaStage, StageStatus};
