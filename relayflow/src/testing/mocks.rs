//! Scripted providers for tests and simulations.
//!
//! Each provider replays a queue of outcomes, then falls back to a default
//! outcome (success unless set otherwise). Calls are counted so tests can
//! assert that a delivered stage is never called again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::ProviderError;
use crate::providers::{
    EnrichedPayload, EnrichmentProvider, ExternalRef, IssueTracker, Priority, SubmissionInput,
    TaskManager,
};

#[derive(Debug, Default)]
struct Script {
    queued: Mutex<VecDeque<Option<ProviderError>>>,
    default_failure: Mutex<Option<ProviderError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl Script {
    fn failing(error: ProviderError) -> Self {
        let script = Self::default();
        *script.default_failure.lock() = Some(error);
        script
    }

    /// Returns the 1-based call number on success.
    async fn step(&self) -> Result<usize, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queued.lock().pop_front();
        let failure = match queued {
            Some(outcome) => outcome,
            None => self.default_failure.lock().clone(),
        };
        match failure {
            Some(error) => Err(error),
            None => Ok(call),
        }
    }
}

macro_rules! scripted_controls {
    ($ty:ident) => {
        impl $ty {
            /// Queues a success for the next unscripted call.
            pub fn then_ok(&self) -> &Self {
                self.script.queued.lock().push_back(None);
                self
            }

            /// Queues a failure for the next unscripted call.
            pub fn then_fail(&self, error: ProviderError) -> &Self {
                self.script.queued.lock().push_back(Some(error));
                self
            }

            /// Queues `n` identical failures.
            pub fn then_fail_times(&self, n: usize, error: &ProviderError) -> &Self {
                let mut queued = self.script.queued.lock();
                for _ in 0..n {
                    queued.push_back(Some(error.clone()));
                }
                drop(queued);
                self
            }

            /// Makes every call past the queue fail with `error`.
            pub fn fail_by_default(&self, error: ProviderError) {
                *self.script.default_failure.lock() = Some(error);
            }

            /// Makes every call past the queue succeed.
            pub fn recover(&self) {
                *self.script.default_failure.lock() = None;
            }

            /// Delays every call before it resolves.
            pub fn set_delay(&self, delay: Duration) {
                *self.script.delay.lock() = Some(delay);
            }

            /// Number of calls received.
            #[must_use]
            pub fn calls(&self) -> usize {
                self.script.calls.load(Ordering::SeqCst)
            }
        }
    };
}

/// Enrichment provider producing a deterministic enriched payload.
#[derive(Debug, Default)]
pub struct ScriptedEnrichment {
    script: Script,
}

impl ScriptedEnrichment {
    /// Always succeeds unless scripted otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fails with `error` unless scripted otherwise.
    #[must_use]
    pub fn failing(error: ProviderError) -> Self {
        Self {
            script: Script::failing(error),
        }
    }

    /// The payload a successful call returns for `input`.
    #[must_use]
    pub fn enriched(input: &SubmissionInput) -> EnrichedPayload {
        EnrichedPayload {
            text: format!("{}\n\n{}", input.title, input.description).trim().to_string(),
            labels: vec![input.category.clone(), "triaged".to_string()],
            priority: Priority::from_severity(&input.severity).max(Priority::Medium),
            derived_prompt: format!("Investigate and resolve: {}", input.title),
        }
    }
}

scripted_controls!(ScriptedEnrichment);

#[async_trait]
impl EnrichmentProvider for ScriptedEnrichment {
    async fn enrich(&self, input: &SubmissionInput) -> Result<EnrichedPayload, ProviderError> {
        self.script.step().await?;
        Ok(Self::enriched(input))
    }
}

/// Issue tracker returning `ISSUE-<n>` references.
#[derive(Debug, Default)]
pub struct ScriptedIssueTracker {
    script: Script,
    payloads: Mutex<Vec<EnrichedPayload>>,
}

impl ScriptedIssueTracker {
    /// Always succeeds unless scripted otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fails with `error` unless scripted otherwise.
    #[must_use]
    pub fn failing(error: ProviderError) -> Self {
        Self {
            script: Script::failing(error),
            payloads: Mutex::new(Vec::new()),
        }
    }

    /// Payloads received, in call order.
    #[must_use]
    pub fn payloads(&self) -> Vec<EnrichedPayload> {
        self.payloads.lock().clone()
    }
}

scripted_controls!(ScriptedIssueTracker);

#[async_trait]
impl IssueTracker for ScriptedIssueTracker {
    async fn create_issue(
        &self,
        _input: &SubmissionInput,
        payload: &EnrichedPayload,
    ) -> Result<ExternalRef, ProviderError> {
        self.payloads.lock().push(payload.clone());
        let n = self.script.step().await?;
        Ok(ExternalRef::new(
            format!("ISSUE-{n}"),
            format!("https://issues.example.test/ISSUE-{n}"),
        ))
    }
}

/// Task manager returning `TASK-<n>` references.
#[derive(Debug, Default)]
pub struct ScriptedTaskManager {
    script: Script,
    issue_urls: Mutex<Vec<Option<String>>>,
}

impl ScriptedTaskManager {
    /// Always succeeds unless scripted otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fails with `error` unless scripted otherwise.
    #[must_use]
    pub fn failing(error: ProviderError) -> Self {
        Self {
            script: Script::failing(error),
            issue_urls: Mutex::new(Vec::new()),
        }
    }

    /// Issue URLs passed in, in call order.
    #[must_use]
    pub fn issue_urls(&self) -> Vec<Option<String>> {
        self.issue_urls.lock().clone()
    }
}

scripted_controls!(ScriptedTaskManager);

#[async_trait]
impl TaskManager for ScriptedTaskManager {
    async fn create_task(
        &self,
        _input: &SubmissionInput,
        _payload: &EnrichedPayload,
        issue_url: Option<&str>,
    ) -> Result<ExternalRef, ProviderError> {
        self.issue_urls.lock().push(issue_url.map(str::to_owned));
        let n = self.script.step().await?;
        Ok(ExternalRef::new(
            format!("TASK-{n}"),
            format!("https://tasks.example.test/TASK-{n}"),
        ))
    }
}
