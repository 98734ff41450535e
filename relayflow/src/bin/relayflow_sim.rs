//! Runs the relay against scripted providers and prints the outcomes.
//!
//! Four scenarios run concurrently, each on its own isolated harness:
//! every provider healthy, enrichment down, issue tracker down then
//! recovered by a sweep, and an admission burst.

use anyhow::{bail, Context, Result};
use futures::try_join;
use serde_json::{json, Value};
use std::time::Duration;

use relayflow::errors::{ProviderError, RelayError};
use relayflow::observability::init_tracing;
use relayflow::prelude::RelayConfig;
use relayflow::testing::{
    fast_config, intake, security_submission, RelayHarness, ScriptedEnrichment,
    ScriptedIssueTracker, ScriptedTaskManager,
};
use relayflow::utils::{generate_uuid, iso_timestamp};

async fn all_healthy() -> Result<Value> {
    let harness = RelayHarness::new(fast_config())?;
    let response = harness
        .orchestrator
        .submit(intake("198.51.100.10", security_submission()))
        .await?;
    Ok(json!({ "scenario": "all_healthy", "response": response }))
}

async fn enrichment_down() -> Result<Value> {
    let harness = RelayHarness::with_providers(
        fast_config(),
        ScriptedEnrichment::failing(ProviderError::from_message("enrichment", "connect ETIMEDOUT")),
        ScriptedIssueTracker::new(),
        ScriptedTaskManager::new(),
    )?;
    let response = harness
        .orchestrator
        .submit(intake("198.51.100.11", security_submission()))
        .await?;
    Ok(json!({
        "scenario": "enrichment_down",
        "response": response,
        "issue_payloads": harness.issues.payloads(),
    }))
}

async fn issue_tracker_recovers() -> Result<Value> {
    let harness = RelayHarness::with_providers(
        fast_config(),
        ScriptedEnrichment::new(),
        ScriptedIssueTracker::failing(ProviderError::http("issue_tracker", 503, "maintenance")),
        ScriptedTaskManager::new(),
    )?;
    let response = harness
        .orchestrator
        .submit(intake("198.51.100.12", security_submission()))
        .await?;
    let queued = harness.orchestrator.store().stats().await;

    harness.issues.recover();
    let reports = harness
        .orchestrator
        .operator_gate()
        .trigger_recovery(fast_config().operator_secret.as_deref())
        .await
        .context("recovery sweep failed")?;

    Ok(json!({
        "scenario": "issue_tracker_recovers",
        "response": response,
        "queue_before_sweep": queued,
        "recovery": reports,
        "queue_after_sweep": harness.orchestrator.store().stats().await,
        "task_calls": harness.tasks.calls(),
    }))
}

async fn admission_burst() -> Result<Value> {
    let harness = RelayHarness::new(fast_config())?;
    let mut outcomes = Vec::new();

    for _ in 0..6 {
        match harness
            .orchestrator
            .submit(intake("203.0.113.99", security_submission()))
            .await
        {
            Ok(response) => outcomes.push(json!({
                "allowed": true,
                "remaining": response.rate_limit.remaining,
            })),
            Err(RelayError::AdmissionDenied(decision)) => outcomes.push(json!({
                "allowed": false,
                "remaining": decision.remaining,
                "reset_at": decision.reset_at,
                "headers": decision.headers(),
            })),
            Err(other) => bail!("unexpected intake error: {other}"),
        }
        harness.clock.advance(Duration::from_secs(1));
    }

    Ok(json!({ "scenario": "admission_burst", "requests": outcomes }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::from_env().context("invalid RELAYFLOW_* configuration")?;
    init_tracing(config.log_format).context("installing tracing subscriber")?;

    let (healthy, degraded, recovered, burst) = try_join!(
        all_healthy(),
        enrichment_down(),
        issue_tracker_recovers(),
        admission_burst()
    )?;

    let report = json!({
        "run_id": generate_uuid(),
        "generated_at": iso_timestamp(),
        "scenarios": [healthy, degraded, recovered, burst],
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );
    Ok(())
}
