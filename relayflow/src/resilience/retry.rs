//! Retry executor with bounded exponential backoff.
//!
//! Delays follow `min(base * 2^attempt_index, max)` with no jitter. Each
//! failure is classified before deciding whether to wait and try again, so
//! permanent errors surface after a single invocation.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::errors::{ProviderError, RelayError};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Delay before the retry that follows attempt `attempt_index` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt_index);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Sum of the first `k` backoff delays.
    #[must_use]
    pub fn total_delay(&self, k: u32) -> Duration {
        (0..k).map(|i| self.delay_for(i)).sum()
    }
}

/// Classifies errors for the retry executor.
pub trait Retryable {
    /// Returns true if another attempt may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        ProviderError::is_retryable(self)
    }
}

impl Retryable for RelayError {
    fn is_retryable(&self) -> bool {
        // An open circuit will not close within a backoff window.
        matches!(self, Self::Provider(err) if err.is_retryable())
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Makes a retry decision for a failure of attempt `attempt_index`.
#[must_use]
pub fn should_retry(config: &RetryConfig, attempt_index: u32, retryable: bool) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if attempt_index >= config.max_retries {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(config.delay_for(attempt_index))
}

/// One failed attempt observed by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 0-based attempt index.
    pub attempt_index: u32,
    /// Delay waited before the next attempt, if one followed.
    pub delay: Option<Duration>,
    /// Classification of the failure.
    pub retryable: bool,
}

/// Result of [`try_with_retry`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result.
    pub result: Result<T, E>,
    /// Number of times the operation was invoked.
    pub attempts: u32,
    /// True if the operation failed with a retryable error on its last allowed attempt.
    pub exhausted: bool,
    /// Every failed attempt, in order.
    pub failures: Vec<RetryAttempt>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Returns true if the operation eventually succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns the result, discarding attempt metadata.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

impl<T> RetryOutcome<T, ProviderError> {
    /// Converts the outcome into the relay error taxonomy.
    ///
    /// Exhausted retryable failures become [`RelayError::RetryExhausted`];
    /// non-retryable failures surface as [`RelayError::Provider`].
    pub fn into_relay_result(self) -> Result<T, RelayError> {
        let attempts = self.attempts;
        let exhausted = self.exhausted;
        self.result.map_err(|source| {
            if exhausted {
                RelayError::RetryExhausted { attempts, source }
            } else {
                RelayError::Provider(source)
            }
        })
    }
}

/// Executes an operation with retry logic, reporting attempt metadata.
///
/// Never returns early on its own account: the final error of the
/// operation is carried in [`RetryOutcome::result`].
pub async fn try_with_retry<T, E, F, Fut, C>(
    config: &RetryConfig,
    key: &str,
    is_retryable: C,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt_index: u32 = 0;
    let mut failures = Vec::new();

    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt_index + 1,
                    exhausted: false,
                    failures,
                };
            }
            Err(e) => {
                let retryable = is_retryable(&e);
                match should_retry(config, attempt_index, retryable) {
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(
                            key,
                            attempt = attempt_index + 1,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Retrying after error"
                        );
                        failures.push(RetryAttempt {
                            attempt_index,
                            delay: Some(delay),
                            retryable,
                        });
                        tokio::time::sleep(delay).await;
                        attempt_index += 1;
                    }
                    decision => {
                        let exhausted = decision == RetryDecision::GiveUp;
                        tracing::debug!(
                            key,
                            attempts = attempt_index + 1,
                            exhausted,
                            error = %e,
                            "Giving up"
                        );
                        failures.push(RetryAttempt {
                            attempt_index,
                            delay: None,
                            retryable,
                        });
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt_index + 1,
                            exhausted,
                            failures,
                        };
                    }
                }
            }
        }
    }
}

/// Executes an operation with retry logic.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once retries are exhausted.
pub async fn with_retry<T, E, F, Fut, C>(
    config: &RetryConfig,
    key: &str,
    is_retryable: C,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    try_with_retry(config, key, is_retryable, operation)
        .await
        .into_result()
}

/// [`with_retry`] using the error type's default classification.
pub async fn with_default_retry<T, E, F, Fut>(
    config: &RetryConfig,
    key: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    with_retry(config, key, |e: &E| e.is_retryable(), operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn transient() -> ProviderError {
        ProviderError::http("svc", 503, "unavailable")
    }

    fn permanent() -> ProviderError {
        ProviderError::http("svc", 400, "bad request")
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30000);
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let config = RetryConfig::new();
        assert_eq!(config.delay_for(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for(5), Duration::from_millis(30000));
        assert_eq!(config.delay_for(64), Duration::from_millis(30000));
        assert_eq!(config.total_delay(3), Duration::from_millis(7000));
    }

    #[test]
    fn test_should_retry_decisions() {
        let config = RetryConfig::new().with_max_retries(2);
        assert_eq!(should_retry(&config, 0, false), RetryDecision::NotRetryable);
        assert_eq!(
            should_retry(&config, 0, true),
            RetryDecision::Retry(Duration::from_millis(1000))
        );
        assert_eq!(
            should_retry(&config, 1, true),
            RetryDecision::Retry(Duration::from_millis(2000))
        );
        assert_eq!(should_retry(&config, 2, true), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_success_first_try() {
        let config = RetryConfig::new();
        let mut calls = 0;

        let result: Result<i32, ProviderError> =
            with_default_retry(&config, "test", || {
                calls += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_invokes_once() {
        let config = RetryConfig::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = try_with_retry(&config, "test", ProviderError::is_retryable, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(permanent()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.exhausted);
        assert!(matches!(
            outcome.into_relay_result(),
            Err(RelayError::Provider(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_k_failures_then_success_waits_backoff() {
        let config = RetryConfig::new();
        let k = 2;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();

        let outcome = try_with_retry(&config, "test", ProviderError::is_retryable, || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < k {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), k + 1);
        assert_eq!(outcome.attempts, k + 1);
        assert!(started.elapsed() >= config.total_delay(k));
        let delays: Vec<_> = outcome.failures.iter().map(|f| f.delay).collect();
        assert_eq!(
            delays,
            vec![Some(Duration::from_millis(1000)), Some(Duration::from_millis(2000))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_propagates_last_error() {
        let config = RetryConfig::new().with_max_retries(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = try_with_retry(&config, "test", ProviderError::is_retryable, || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(ProviderError::http("svc", 500, format!("attempt {n}"))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(outcome.exhausted);
        match outcome.into_relay_result() {
            Err(RelayError::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source.message, "attempt 3");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let config = RetryConfig::new().with_base_delay_ms(10);
        let mut calls = 0;

        let result: Result<(), String> = with_retry(
            &config,
            "test",
            |e: &String| e.contains("again"),
            || {
                calls += 1;
                let message = if calls < 2 { "try again" } else { "fatal" };
                async move { Err(message.to_string()) }
            },
        )
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_relay_error_classification() {
        assert!(Retryable::is_retryable(&RelayError::Provider(transient())));
        assert!(!Retryable::is_retryable(&RelayError::Provider(permanent())));
        assert!(!Retryable::is_retryable(&RelayError::Unauthorized));
    }
}
