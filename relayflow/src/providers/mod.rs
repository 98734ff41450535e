//! External collaborators consumed by the saga.
//!
//! The enrichment service, issue tracker and task manager are reached only
//! through these traits. Implementations report failures as
//! [`ProviderError`] so the retry executor can classify them.

mod types;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::errors::ProviderError;

pub use types::{
    EnrichedPayload, ExternalRef, Priority, SubmissionInput, MAX_DESCRIPTION_CHARS,
    MAX_TITLE_CHARS,
};

/// Turns a raw submission into an enriched payload.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Enriches a submission.
    async fn enrich(&self, input: &SubmissionInput) -> Result<EnrichedPayload, ProviderError>;
}

/// Creates issues in an external tracker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Creates an issue and returns a reference to it.
    async fn create_issue(
        &self,
        input: &SubmissionInput,
        payload: &EnrichedPayload,
    ) -> Result<ExternalRef, ProviderError>;
}

/// Creates tasks in an external task manager.
#[async_trait]
pub trait TaskManager: Send + Sync {
    /// Creates a task, linking the issue when its URL is known.
    async fn create_task(
        &self,
        input: &SubmissionInput,
        payload: &EnrichedPayload,
        issue_url: Option<&str>,
    ) -> Result<ExternalRef, ProviderError>;
}

/// Bounds a provider call by `deadline`.
///
/// An elapsed deadline becomes a retryable [`ProviderError`] of kind
/// `Timeout`; the abandoned call is dropped.
pub async fn with_deadline<T, Fut>(
    provider: &str,
    deadline: Duration,
    call: Fut,
) -> Result<T, ProviderError>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(provider, deadline)),
    }
}
