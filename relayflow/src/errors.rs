//! Error types for relayflow.
//!
//! The taxonomy separates errors that reject a submission before any
//! stage runs (admission, validation) from errors that are converted into
//! per-stage status (provider failures, open circuits) and errors that only
//! affect best-effort recovery (queue capacity, retry ceiling).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::core::SagaStage;
use crate::resilience::RateLimitDecision;
use crate::utils::ceil_secs;

/// Result alias used throughout relayflow.
pub type Result<T> = std::result::Result<T, RelayError>;

/// The main error type for relayflow operations.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// The caller exceeded its admission quota.
    #[error("rate limit exceeded, retry after {}s", .0.retry_after_secs())]
    AdmissionDenied(RateLimitDecision),

    /// The provider's circuit is open.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// A retryable provider error persisted through every retry.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last provider error.
        source: ProviderError,
    },

    /// A non-retryable provider error.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// A stage fell back to a local substitute.
    #[error("stage {stage} degraded: {reason}")]
    StageDegraded {
        /// The degraded stage.
        stage: SagaStage,
        /// Why the provider result was unavailable.
        reason: String,
    },

    /// The submission queue is at capacity.
    #[error("queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// A queued record has used all of its automatic retries.
    #[error("retry ceiling reached for submission {id}")]
    RetryCeilingReached {
        /// The submission id.
        id: Uuid,
    },

    /// No queued record has the given id.
    #[error("submission {id} not found")]
    NotFound {
        /// The submission id.
        id: Uuid,
    },

    /// The submission failed structural validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operator secret was missing or wrong.
    #[error("unauthorized")]
    Unauthorized,

    /// Another recovery sweep is running.
    #[error("recovery sweep already in progress")]
    SweepInProgress,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Returns a stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied(_) => "ADMISSION_DENIED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::StageDegraded { .. } => "STAGE_DEGRADED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::RetryCeilingReached { .. } => "RETRY_CEILING_REACHED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SweepInProgress => "SWEEP_IN_PROGRESS",
            Self::Config(_) => "CONFIG",
        }
    }

    /// Returns true if waiting and trying again may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AdmissionDenied(_)
            | Self::CircuitOpen(_)
            | Self::RetryExhausted { .. }
            | Self::QueueFull { .. }
            | Self::SweepInProgress => true,
            Self::Provider(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("transient".to_string(), serde_json::json!(self.is_transient()));

        match self {
            Self::AdmissionDenied(decision) => {
                map.insert(
                    "retry_after_secs".to_string(),
                    serde_json::json!(decision.retry_after_secs()),
                );
            }
            Self::CircuitOpen(err) => {
                map.insert("service".to_string(), serde_json::json!(err.service));
                map.insert("retry_in_secs".to_string(), serde_json::json!(err.retry_in_secs));
            }
            Self::RetryExhausted { attempts, source } => {
                map.insert("attempts".to_string(), serde_json::json!(attempts));
                map.insert("provider".to_string(), serde_json::json!(source.provider));
            }
            Self::Provider(err) => {
                map.insert("provider".to_string(), serde_json::json!(err.provider));
            }
            Self::StageDegraded { stage, .. } => {
                map.insert("stage".to_string(), serde_json::json!(stage));
            }
            Self::RetryCeilingReached { id } | Self::NotFound { id } => {
                map.insert("id".to_string(), serde_json::json!(id));
            }
            _ => {}
        }

        map
    }
}

/// Error returned instead of calling a provider whose circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("circuit open for {service}, retry in {retry_in_secs}s")]
pub struct CircuitOpenError {
    /// The service whose circuit is open.
    pub service: String,
    /// Whole seconds until the circuit admits a probe.
    pub retry_in_secs: u64,
}

impl CircuitOpenError {
    /// Creates a new circuit open error.
    #[must_use]
    pub fn new(service: impl Into<String>, retry_in: Duration) -> Self {
        Self {
            service: service.into(),
            retry_in_secs: ceil_secs(retry_in),
        }
    }
}

/// Broad category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "status")]
pub enum ProviderErrorKind {
    /// The call did not complete within its deadline.
    Timeout,
    /// Connection refused, DNS failure, connection reset.
    Network,
    /// The provider answered with an HTTP error status.
    Http(u16),
    /// The provider answered but the payload was unusable.
    InvalidResponse,
    /// Anything else.
    Other,
}

impl ProviderErrorKind {
    /// Infers a kind from an untyped error message.
    #[must_use]
    pub fn infer(message: &str) -> Self {
        static TIMEOUT: OnceLock<Regex> = OnceLock::new();
        static NETWORK: OnceLock<Regex> = OnceLock::new();
        static STATUS: OnceLock<Regex> = OnceLock::new();

        let timeout = TIMEOUT.get_or_init(|| {
            Regex::new(r"(?i)\b(timed?\s?out|timeout|ETIMEDOUT|deadline exceeded)\b")
                .expect("static timeout pattern")
        });
        let network = NETWORK.get_or_init(|| {
            Regex::new(r"(?i)\b(ECONNREFUSED|ENOTFOUND|ECONNRESET|EAI_AGAIN|connection (refused|reset)|dns)\b")
                .expect("static network pattern")
        });
        let status = STATUS.get_or_init(|| {
            Regex::new(r"(?i)\b(?:status|http)\s*:?\s*([1-5]\d{2})\b").expect("static status pattern")
        });

        if timeout.is_match(message) {
            Self::Timeout
        } else if network.is_match(message) {
            Self::Network
        } else if let Some(code) = status
            .captures(message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
        {
            Self::Http(code)
        } else {
            Self::Other
        }
    }

    /// Default retryability: timeouts, network failures and 5xx. Every 4xx,
    /// 429 included, fails on the first attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network => true,
            Self::Http(status) => *status >= 500,
            Self::InvalidResponse | Self::Other => false,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::Http(status) => write!(f, "http {status}"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::Other => write!(f, "error"),
        }
    }
}

/// An error reported by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{provider} failed ({kind}): {message}")]
pub struct ProviderError {
    /// Provider service name.
    pub provider: String,
    /// Failure category.
    pub kind: ProviderErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ProviderError {
    /// Creates a provider error of an explicit kind.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Creates a network-level error.
    #[must_use]
    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Network, message)
    }

    /// Creates an HTTP status error.
    #[must_use]
    pub fn http(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Http(status), message)
    }

    /// Creates an error whose kind is inferred from the message.
    #[must_use]
    pub fn from_message(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = ProviderErrorKind::infer(&message);
        Self::new(provider, kind, message)
    }

    /// Returns true if the default classification considers this retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_timeout_and_network() {
        assert_eq!(ProviderErrorKind::infer("request timed out"), ProviderErrorKind::Timeout);
        assert_eq!(ProviderErrorKind::infer("ETIMEDOUT"), ProviderErrorKind::Timeout);
        assert_eq!(
            ProviderErrorKind::infer("connect ECONNREFUSED 127.0.0.1:443"),
            ProviderErrorKind::Network
        );
        assert_eq!(
            ProviderErrorKind::infer("getaddrinfo ENOTFOUND api.example.com"),
            ProviderErrorKind::Network
        );
        assert_eq!(ProviderErrorKind::infer("socket hang up: ECONNRESET"), ProviderErrorKind::Network);
    }

    #[test]
    fn test_infer_http_status() {
        assert_eq!(ProviderErrorKind::infer("HTTP 503 unavailable"), ProviderErrorKind::Http(503));
        assert_eq!(ProviderErrorKind::infer("status: 404"), ProviderErrorKind::Http(404));
        assert_eq!(ProviderErrorKind::infer("bad things"), ProviderErrorKind::Other);
    }

    #[test]
    fn test_default_retryability() {
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(ProviderErrorKind::Network.is_retryable());
        assert!(ProviderErrorKind::Http(500).is_retryable());
        assert!(ProviderErrorKind::Http(502).is_retryable());
        assert!(!ProviderErrorKind::Http(429).is_retryable());
        assert!(!ProviderErrorKind::Http(400).is_retryable());
        assert!(!ProviderErrorKind::Http(404).is_retryable());
        assert!(!ProviderErrorKind::InvalidResponse.is_retryable());
        assert!(!ProviderErrorKind::Other.is_retryable());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::http("issue_tracker", 502, "bad gateway");
        assert_eq!(err.to_string(), "issue_tracker failed (http 502): bad gateway");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_circuit_open_message_rounds_up() {
        let err = CircuitOpenError::new("task_manager", Duration::from_millis(12_300));
        assert_eq!(err.retry_in_secs, 13);
        assert_eq!(err.to_string(), "circuit open for task_manager, retry in 13s");
    }

    #[test]
    fn test_relay_error_codes_and_transience() {
        let exhausted = RelayError::RetryExhausted {
            attempts: 4,
            source: ProviderError::timeout("enrichment", Duration::from_secs(30)),
        };
        assert_eq!(exhausted.code(), "RETRY_EXHAUSTED");
        assert!(exhausted.is_transient());

        let permanent = RelayError::from(ProviderError::http("issue_tracker", 422, "invalid"));
        assert_eq!(permanent.code(), "PROVIDER_ERROR");
        assert!(!permanent.is_transient());

        assert!(!RelayError::Unauthorized.is_transient());
        assert!(RelayError::QueueFull { capacity: 10 }.is_transient());
    }

    #[test]
    fn test_relay_error_to_dict() {
        let err = RelayError::from(CircuitOpenError::new("issue_tracker", Duration::from_secs(30)));
        let dict = err.to_dict();

        assert_eq!(dict.get("code").unwrap(), "CIRCUIT_OPEN");
        assert_eq!(dict.get("service").unwrap(), "issue_tracker");
        assert_eq!(dict.get("retry_in_secs").unwrap(), 30);
    }

    #[test]
    fn test_provider_error_kind_serialize() {
        let json = serde_json::to_value(ProviderErrorKind::Http(503)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "http", "status": 503}));
    }
}
