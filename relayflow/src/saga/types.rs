//! Intake and recovery request/response types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::{OutcomeStatus, SagaStage, StageStatus};
use crate::providers::{ExternalRef, SubmissionInput};
use crate::resilience::RateLimitDecision;

/// A submission presented at intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeRequest {
    /// Caller identity used as the admission key.
    pub identity: String,
    /// The submission itself.
    pub input: SubmissionInput,
}

impl IntakeRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(identity: impl Into<String>, input: SubmissionInput) -> Self {
        Self {
            identity: identity.into(),
            input,
        }
    }
}

/// What happened to one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// The stage.
    pub stage: SagaStage,
    /// Its outcome.
    pub status: StageStatus,
    /// Provider invocations; 0 when the circuit was open.
    pub attempts: u32,
    /// Wall time spent in the stage, retries included.
    pub duration_ms: u64,
    /// Machine code of the failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Created object, for delivery stages that succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
}

/// Response to an admitted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeResponse {
    /// Correlates log lines and events of this saga run.
    pub saga_id: Uuid,
    /// Aggregate delivery outcome.
    pub status: OutcomeStatus,
    /// Created issue, if any.
    pub issue_ref: Option<ExternalRef>,
    /// Created task, if any.
    pub task_ref: Option<ExternalRef>,
    /// Per-stage outcomes in execution order.
    pub stages: Vec<StageReport>,
    /// True if the local enrichment fallback was used.
    pub enrichment_degraded: bool,
    /// True if the submission was queued for recovery.
    pub queued: bool,
    /// Queue record id, when queued.
    pub queue_id: Option<Uuid>,
    /// Admission quota after this request.
    pub rate_limit: RateLimitDecision,
}

impl IntakeResponse {
    /// Returns the report for a stage.
    #[must_use]
    pub fn stage(&self, stage: SagaStage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }
}

/// Result of one record's recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Queue record id.
    pub id: Uuid,
    /// True if every delivery stage has now succeeded.
    pub success: bool,
    /// Stages re-executed in this attempt.
    pub retried_stages: Vec<SagaStage>,
    /// Errors of stages still failing.
    pub remaining_errors: BTreeMap<SagaStage, String>,
}
