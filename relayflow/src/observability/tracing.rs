//! Subscriber setup and span helpers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};
use uuid::Uuid;

use crate::core::SagaStage;
use crate::errors::{RelayError, Result};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "relayflow=info";

/// Output format for the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(RelayError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
/// Fails if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry.with(fmt_layer::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt_layer::layer().json().with_current_span(true))
            .try_init(),
    };

    installed.map_err(|e| RelayError::Config(format!("failed to install tracing subscriber: {e}")))
}

/// Opens the span a saga stage runs inside.
#[must_use]
pub fn stage_span(stage: SagaStage, submission_id: Uuid) -> Span {
    tracing::info_span!(
        "saga_stage",
        stage = %stage,
        service = stage.service_name(),
        submission_id = %submission_id,
    )
}

/// Simple span timing helper.
///
/// Reads tokio's clock so that paused-time tests observe the virtual
/// duration of backoff sleeps.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration in milliseconds.
    #[must_use]
    pub fn finish(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!(span_name = %self.name, duration_ms = elapsed, "Span finished");
        elapsed
    }
}
