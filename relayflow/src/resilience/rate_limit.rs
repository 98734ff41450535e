//! Sliding-window admission gate keyed by caller identity.
//!
//! Each identity owns an ordered window of admission timestamps. Expired
//! timestamps are dropped at the top of every operation, so the window
//! always reflects the trailing `window` ending at "now". Denials anchor
//! `reset_at` on the oldest counted request, which gives true sliding
//! semantics rather than fixed clock-aligned buckets.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::utils::{ceil_secs, duration_between, system_clock, to_chrono, Clock, Timestamp};

/// Configuration for the admission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per identity within one window.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Minimum seconds between opportunistic sweeps of idle identities.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_limit() -> usize {
    5
}

fn default_window_secs() -> u64 {
    15 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Creates a new config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-window limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the window length.
    ///
    /// The window has whole-second resolution; a fractional window is
    /// rounded up, so it never collapses to zero.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_secs = ceil_secs(window);
        self
    }

    /// Sets the sweep interval, truncated to whole seconds.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Gets the window as a Duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Gets the sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Configured limit.
    pub limit: usize,
    /// Requests left in the current window.
    pub remaining: usize,
    /// When the oldest counted request leaves the window.
    pub reset_at: Timestamp,
    /// When the check was made.
    pub checked_at: Timestamp,
}

impl RateLimitDecision {
    /// Time until a denied caller may try again. Zero when allowed.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        if self.allowed {
            Duration::ZERO
        } else {
            duration_between(self.checked_at, self.reset_at)
        }
    }

    /// [`Self::retry_after`] rounded up to whole seconds.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after())
    }

    /// Standard quota metadata for an HTTP response.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }
}

/// Ordered admission timestamps for one identity.
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    hits: VecDeque<Timestamp>,
}

impl RateWindow {
    /// Drops timestamps that have left the window ending at `now`.
    ///
    /// A timestamp exactly `window` old has left the window.
    pub fn recompute(&mut self, now: Timestamp, window: Duration) {
        let cutoff = now - to_chrono(window);
        while self.hits.front().is_some_and(|t| *t <= cutoff) {
            self.hits.pop_front();
        }
    }

    /// Counts timestamps still inside the window ending at `now`.
    #[must_use]
    pub fn live_count(&self, now: Timestamp, window: Duration) -> usize {
        let cutoff = now - to_chrono(window);
        self.hits.iter().filter(|t| **t > cutoff).count()
    }

    /// Oldest timestamp still inside the window ending at `now`.
    #[must_use]
    pub fn oldest_live(&self, now: Timestamp, window: Duration) -> Option<Timestamp> {
        let cutoff = now - to_chrono(window);
        self.hits.iter().find(|t| **t > cutoff).copied()
    }

    /// Returns true if no timestamps are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    fn record(&mut self, now: Timestamp) {
        self.hits.push_back(now);
    }
}

/// Sliding-window rate limiter.
///
/// Never errors: every call produces an allow/deny decision.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, RateWindow>,
    last_sweep: Mutex<Option<Timestamp>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter reading the system clock.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a limiter with an injected clock.
    #[must_use]
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            last_sweep: Mutex::new(None),
            clock,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Checks and, if allowed, consumes one unit of quota.
    pub fn admit(&self, identity: &str) -> RateLimitDecision {
        self.admit_at(identity, self.clock.now())
    }

    /// [`Self::admit`] at an explicit instant.
    pub fn admit_at(&self, identity: &str, now: Timestamp) -> RateLimitDecision {
        self.maybe_sweep(now);

        let window = self.config.window();
        let limit = self.config.limit;
        let window_span = to_chrono(window);

        // The entry guard makes expire, count and append atomic per identity.
        let mut entry = self.windows.entry(identity.to_string()).or_default();
        entry.recompute(now, window);

        let count = entry.hits.len();
        if count >= limit {
            let oldest = entry.hits.front().copied().unwrap_or(now);
            drop(entry);
            debug!(identity, count, limit, "Admission denied");
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: oldest + window_span,
                checked_at: now,
            };
        }

        entry.record(now);
        let count = entry.hits.len();
        let oldest = entry.hits.front().copied().unwrap_or(now);
        drop(entry);

        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - count,
            reset_at: oldest + window_span,
            checked_at: now,
        }
    }

    /// Reports what [`Self::admit`] would decide without consuming quota.
    #[must_use]
    pub fn peek(&self, identity: &str) -> RateLimitDecision {
        self.peek_at(identity, self.clock.now())
    }

    /// [`Self::peek`] at an explicit instant.
    #[must_use]
    pub fn peek_at(&self, identity: &str, now: Timestamp) -> RateLimitDecision {
        let window = self.config.window();
        let limit = self.config.limit;

        let (count, oldest) = self
            .windows
            .get(identity)
            .map(|w| (w.live_count(now, window), w.oldest_live(now, window)))
            .unwrap_or((0, None));

        RateLimitDecision {
            allowed: count < limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: oldest.unwrap_or(now) + to_chrono(window),
            checked_at: now,
        }
    }

    /// Returns the number of identities currently holding a window.
    #[must_use]
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    /// Forgets every window.
    pub fn clear(&self) {
        self.windows.clear();
    }

    /// Drops fully expired identities, at most once per sweep interval.
    fn maybe_sweep(&self, now: Timestamp) {
        {
            let mut last = self.last_sweep.lock();
            if let Some(previous) = *last {
                if duration_between(previous, now) < self.config.sweep_interval() {
                    return;
                }
            }
            *last = Some(now);
        }

        let window = self.config.window();
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.recompute(now, window);
            !w.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "Swept idle rate windows");
        }
    }
}

/// Derives the admission key for a caller.
///
/// Uses the first entry of a forwarded-for chain when present, else the
/// peer address, else `"anonymous"`.
#[must_use]
pub fn client_identity(forwarded_for: Option<&str>, peer_addr: Option<&str>) -> String {
    forwarded_for
        .and_then(|chain| chain.split(',').map(str::trim).find(|s| !s.is_empty()))
        .or_else(|| peer_addr.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or("anonymous")
        .to_string()
}
