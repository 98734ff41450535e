//! Resilience primitives guarding the pipeline and its providers.
//!
//! This module provides:
//! - A sliding-window admission gate for the pipeline's own ingress
//! - Per-provider circuit breakers
//! - A bounded exponential-backoff retry executor
//!
//! Provider calls compose as `breaker.run(service, || retry(call))`: the
//! retry executor is the inner wrapper, so a breaker counts one failure per
//! logical operation rather than one per internal attempt.

mod circuit_breaker;
mod rate_limit;
mod retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitRecord, CircuitState, CircuitStatus,
};
pub use rate_limit::{client_identity, RateLimitConfig, RateLimitDecision, RateLimiter, RateWindow};
pub use retry::{
    should_retry, try_with_retry, with_default_retry, with_retry, RetryAttempt, RetryConfig,
    RetryDecision, RetryOutcome, Retryable,
};
