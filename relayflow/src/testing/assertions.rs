//! Test assertions for saga responses.

use crate::core::{SagaStage, StageStatus};
use crate::saga::{IntakeResponse, StageReport};

/// Returns the report for `stage`, panicking if it is missing.
#[must_use]
pub fn stage_report(response: &IntakeResponse, stage: SagaStage) -> &StageReport {
    response
        .stage(stage)
        .unwrap_or_else(|| panic!("no report for stage {stage}"))
}

/// Asserts that a stage has the expected status.
pub fn assert_stage_status(response: &IntakeResponse, stage: SagaStage, expected: StageStatus) {
    let report = stage_report(response, stage);
    assert_eq!(
        report.status, expected,
        "Expected {stage} to be {expected}, got {} ({:?})",
        report.status, report.error
    );
}

/// Asserts that a stage failed with the given error code.
pub fn assert_stage_error_code(response: &IntakeResponse, stage: SagaStage, code: &str) {
    let report = stage_report(response, stage);
    assert_eq!(
        report.error_code.as_deref(),
        Some(code),
        "Expected {stage} to fail with {code}, got {:?}",
        report.error
    );
}

/// Asserts how many provider invocations a stage made.
pub fn assert_stage_attempts(response: &IntakeResponse, stage: SagaStage, expected: u32) {
    let report = stage_report(response, stage);
    assert_eq!(
        report.attempts, expected,
        "Expected {expected} attempts for {stage}, got {}",
        report.attempts
    );
}
