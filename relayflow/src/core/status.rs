//! Saga stage, phase and outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One provider-facing step of the submission saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStage {
    /// AI enrichment of the raw submission. Never fatal.
    Enrichment,
    /// Issue creation in the issue tracker.
    Issue,
    /// Task creation in the task manager.
    Task,
}

impl SagaStage {
    /// Stages whose failure makes a submission incomplete, in execution order.
    pub const DELIVERY: [Self; 2] = [Self::Issue, Self::Task];

    /// Returns the circuit breaker key for the provider behind this stage.
    ///
    /// Circuits are keyed per provider, not per provider operation.
    #[must_use]
    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Enrichment => "enrichment",
            Self::Issue => "issue_tracker",
            Self::Task => "task_manager",
        }
    }

    /// Returns true for the issue and task stages.
    #[must_use]
    pub const fn is_delivery(self) -> bool {
        matches!(self, Self::Issue | Self::Task)
    }
}

impl fmt::Display for SagaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enrichment => write!(f, "enrichment"),
            Self::Issue => write!(f, "issue"),
            Self::Task => write!(f, "task"),
        }
    }
}

/// Outcome of a single stage within one saga run or recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The provider call succeeded.
    Succeeded,
    /// The provider failed and a local fallback was used instead.
    Degraded,
    /// The provider call failed.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Phase of the saga controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaPhase {
    /// The submission was admitted and validated.
    Received,
    /// Stage 1 is running.
    Enriching,
    /// Stage 2 is running.
    CreatingIssue,
    /// Stage 3 is running.
    CreatingTask,
    /// Stage outcomes are being combined.
    Aggregating,
    /// The response is being assembled.
    Responding,
}

impl fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => write!(f, "received"),
            Self::Enriching => write!(f, "enriching"),
            Self::CreatingIssue => write!(f, "creating_issue"),
            Self::CreatingTask => write!(f, "creating_task"),
            Self::Aggregating => write!(f, "aggregating"),
            Self::Responding => write!(f, "responding"),
        }
    }
}

/// Aggregate outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Every delivery stage succeeded.
    Full,
    /// Some delivery stages succeeded.
    Partial,
    /// No delivery stage succeeded.
    Failed,
}

impl OutcomeStatus {
    /// Aggregates delivery successes out of `total` delivery stages.
    #[must_use]
    pub const fn aggregate(successes: usize, total: usize) -> Self {
        if successes == 0 {
            Self::Failed
        } else if successes < total {
            Self::Partial
        } else {
            Self::Full
        }
    }

    /// Returns true if nothing is left to recover.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Full)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_stage_display() {
        assert_eq!(SagaStage::Enrichment.to_string(), "enrichment");
        assert_eq!(SagaStage::Issue.to_string(), "issue");
        assert_eq!(SagaStage::Task.to_string(), "task");
    }

    #[test]
    fn test_saga_stage_service_names_are_per_provider() {
        assert_eq!(SagaStage::Enrichment.service_name(), "enrichment");
        assert_eq!(SagaStage::Issue.service_name(), "issue_tracker");
        assert_eq!(SagaStage::Task.service_name(), "task_manager");
        assert!(!SagaStage::Enrichment.is_delivery());
        assert!(SagaStage::DELIVERY.iter().all(|s| s.is_delivery()));
    }

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(StageStatus::Degraded.to_string(), "degraded");
        assert_eq!(SagaPhase::CreatingTask.to_string(), "creating_task");
    }

    #[test]
    fn test_outcome_aggregate() {
        assert_eq!(OutcomeStatus::aggregate(0, 2), OutcomeStatus::Failed);
        assert_eq!(OutcomeStatus::aggregate(1, 2), OutcomeStatus::Partial);
        assert_eq!(OutcomeStatus::aggregate(2, 2), OutcomeStatus::Full);
        assert!(OutcomeStatus::Full.is_complete());
        assert!(!OutcomeStatus::Partial.is_complete());
    }

    #[test]
    fn test_serialize_snake_case() {
        let json = serde_json::to_string(&SagaStage::Issue).unwrap();
        assert_eq!(json, r#""issue""#);

        let status: OutcomeStatus = serde_json::from_str(r#""partial""#).unwrap();
        assert_eq!(status, OutcomeStatus::Partial);

        let phase = serde_json::to_string(&SagaPhase::CreatingIssue).unwrap();
        assert_eq!(phase, r#""creating_issue""#);
    }
}
