//! Observability utilities.

mod tracing;

pub use tracing::{init_tracing, stage_span, LogFormat, SpanTimer, DEFAULT_FILTER};
