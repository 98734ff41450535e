//! Runtime configuration.
//!
//! Every section deserializes with per-field defaults, so a partial JSON
//! document (or none at all) yields a working configuration. Environment
//! variables prefixed `RELAYFLOW_` override individual fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::errors::RelayError;
use crate::observability::LogFormat;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The JSON document could not be parsed.
    #[error("invalid config document: {0}")]
    Parse(String),

    /// An environment variable held an unusable value.
    #[error("invalid value '{value}' for {var}")]
    Env {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
    },

    /// A field failed validation.
    #[error("{field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<ConfigError> for RelayError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Submission queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued records.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Records older than this many seconds are purged.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Minimum seconds between opportunistic purges.
    #[serde(default = "default_queue_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Automatic recovery attempts per record.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
}

fn default_capacity() -> usize {
    1000
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_queue_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_queue_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_queue_sweep_interval_secs(),
            max_retries: default_queue_max_retries(),
        }
    }
}

impl QueueConfig {
    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the maximum record age.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    /// Sets the purge interval.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Sets the per-record retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Gets the maximum record age as a Duration.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Gets the purge interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Per-call provider deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Enrichment call deadline in milliseconds.
    #[serde(default = "default_enrichment_timeout_ms")]
    pub enrichment_ms: u64,
    /// Issue and task call deadline in milliseconds.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_ms: u64,
}

fn default_enrichment_timeout_ms() -> u64 {
    45_000
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enrichment_ms: default_enrichment_timeout_ms(),
            delivery_ms: default_delivery_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Sets both deadlines.
    #[must_use]
    pub fn with_deadlines(mut self, enrichment: Duration, delivery: Duration) -> Self {
        self.enrichment_ms = duration_ms(enrichment);
        self.delivery_ms = duration_ms(delivery);
        self
    }

    /// Enrichment deadline.
    #[must_use]
    pub fn enrichment(&self) -> Duration {
        Duration::from_millis(self.enrichment_ms)
    }

    /// Delivery deadline.
    #[must_use]
    pub fn delivery(&self) -> Duration {
        Duration::from_millis(self.delivery_ms)
    }
}

/// Recovery sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Seconds a record must rest after an attempt before the next; 0 disables.
    #[serde(default = "default_min_retry_interval_secs")]
    pub min_retry_interval_secs: u64,
}

fn default_min_retry_interval_secs() -> u64 {
    60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_retry_interval_secs: default_min_retry_interval_secs(),
        }
    }
}

impl RecoveryConfig {
    /// Sets the minimum retry interval.
    #[must_use]
    pub fn with_min_retry_interval(mut self, interval: Duration) -> Self {
        self.min_retry_interval_secs = interval.as_secs();
        self
    }

    /// Gets the minimum retry interval as a Duration.
    #[must_use]
    pub fn min_retry_interval(&self) -> Duration {
        Duration::from_secs(self.min_retry_interval_secs)
    }
}

/// Top-level configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Admission gate.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Provider circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Provider call retries.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Submission queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Provider call deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Recovery sweep.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Log output format for the binary.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Shared secret guarding the operator recovery trigger.
    #[serde(default, skip_serializing)]
    pub operator_secret: Option<String>,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("rate_limit", &self.rate_limit)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("retry", &self.retry)
            .field("queue", &self.queue)
            .field("timeouts", &self.timeouts)
            .field("recovery", &self.recovery)
            .field("log_format", &self.log_format)
            .field("operator_secret", &self.operator_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RelayConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from defaults overridden by `RELAYFLOW_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup, then validates.
    pub fn overlay_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        env.read("RELAYFLOW_RATE_LIMIT", &mut self.rate_limit.limit)?;
        env.read("RELAYFLOW_RATE_WINDOW_SECS", &mut self.rate_limit.window_secs)?;
        env.read(
            "RELAYFLOW_BREAKER_FAILURE_THRESHOLD",
            &mut self.circuit_breaker.failure_threshold,
        )?;
        env.read("RELAYFLOW_BREAKER_COOLDOWN_SECS", &mut self.circuit_breaker.cooldown_secs)?;
        env.read("RELAYFLOW_RETRY_MAX", &mut self.retry.max_retries)?;
        env.read("RELAYFLOW_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        env.read("RELAYFLOW_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms)?;
        env.read("RELAYFLOW_QUEUE_CAPACITY", &mut self.queue.capacity)?;
        env.read("RELAYFLOW_QUEUE_MAX_AGE_SECS", &mut self.queue.max_age_secs)?;
        env.read("RELAYFLOW_QUEUE_MAX_RETRIES", &mut self.queue.max_retries)?;
        env.read("RELAYFLOW_ENRICHMENT_TIMEOUT_MS", &mut self.timeouts.enrichment_ms)?;
        env.read("RELAYFLOW_DELIVERY_TIMEOUT_MS", &mut self.timeouts.delivery_ms)?;
        env.read(
            "RELAYFLOW_RECOVERY_MIN_INTERVAL_SECS",
            &mut self.recovery.min_retry_interval_secs,
        )?;
        env.read("RELAYFLOW_LOG_FORMAT", &mut self.log_format)?;

        if let Some(secret) = lookup("RELAYFLOW_OPERATOR_SECRET").filter(|s| !s.is_empty()) {
            self.operator_secret = Some(secret);
        }

        self.validate()?;
        Ok(self)
    }

    /// Sets the operator secret.
    #[must_use]
    pub fn with_operator_secret(mut self, secret: impl Into<String>) -> Self {
        self.operator_secret = Some(secret.into());
        self
    }

    /// Rejects configurations the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.rate_limit.limit == 0 {
            return Err(invalid("rate_limit.limit", "must be at least 1"));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(invalid("rate_limit.window_secs", "must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.half_open_success_threshold",
                "must be at least 1",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms", "must not exceed retry.max_delay_ms"));
        }
        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity", "must be at least 1"));
        }
        if self.timeouts.enrichment_ms == 0 || self.timeouts.delivery_ms == 0 {
            return Err(invalid("timeouts", "deadlines must be non-zero"));
        }
        Ok(())
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn read<T: std::str::FromStr>(&self, var: &str, slot: &mut T) -> Result<(), ConfigError> {
        let Some(raw) = (self.lookup)(var) else {
            return Ok(());
        };
        *slot = raw.trim().parse().map_err(|_| ConfigError::Env {
            var: var.to_string(),
            value: raw.clone(),
        })?;
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.rate_limit.limit, 5);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(900));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.max_age(), Duration::from_secs(86_400));
        assert_eq!(config.timeouts.delivery(), Duration::from_secs(10));
        assert_eq!(config.timeouts.enrichment(), Duration::from_secs(45));
        assert_eq!(config.recovery.min_retry_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = RelayConfig::from_json_str(
            r#"{"rate_limit": {"limit": 10}, "queue": {"max_retries": 5}, "log_format": "json"}"#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.limit, 10);
        assert_eq!(config.rate_limit.window_secs, 900);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_json_rejects_invalid() {
        let err = RelayConfig::from_json_str(r#"{"retry": {"base_delay_ms": 5000, "max_delay_ms": 100}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.base_delay_ms", .. }));

        assert!(matches!(
            RelayConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("RELAYFLOW_RATE_LIMIT", "20"),
            ("RELAYFLOW_QUEUE_CAPACITY", " 50 "),
            ("RELAYFLOW_LOG_FORMAT", "json"),
            ("RELAYFLOW_OPERATOR_SECRET", "hunter2"),
        ]
        .into_iter()
        .collect();

        let config = RelayConfig::default()
            .overlay_env(|k| vars.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.rate_limit.limit, 20);
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.operator_secret.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_env_overlay_reports_bad_value() {
        let err = RelayConfig::default()
            .overlay_env(|k| (k == "RELAYFLOW_RETRY_MAX").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Env {
                var: "RELAYFLOW_RETRY_MAX".to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = RelayConfig {
            queue: QueueConfig::default().with_capacity(0),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let relay: RelayError = config.validate().unwrap_err().into();
        assert_eq!(relay.code(), "CONFIG");
    }

    #[test]
    fn test_secret_is_not_serialized_or_printed() {
        let config = RelayConfig::default().with_operator_secret("s3cret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
