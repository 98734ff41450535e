//! Testing utilities for relayflow.
//!
//! This module provides:
//! - Scripted providers with call counting
//! - Fixtures and a pre-wired harness on a manual clock
//! - Assertions over saga responses

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_stage_attempts, assert_stage_error_code, assert_stage_status, stage_report,
};
pub use fixtures::{
    epoch, fast_config, intake, minor_submission, security_submission, RelayHarness,
    TEST_OPERATOR_SECRET,
};
pub use mocks::{ScriptedEnrichment, ScriptedIssueTracker, ScriptedTaskManager};
