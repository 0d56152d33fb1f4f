//! Per-provider health accounting.
//!
//! Tracks failure streaks and totals, decides when a provider should
//! degrade, and computes the exponential recovery backoff.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Health metrics for one provider.
///
/// Mutated either under the provider's lifecycle lock or behind its own
/// mutex; this type itself is not synchronised.
#[derive(Debug)]
pub struct HealthTracker {
    max_consecutive_failures: u32,
    backoff_cap: Duration,

    consecutive_failures: u32,
    total_invocations: u64,
    total_failures: u64,

    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_failure_instant: Option<Instant>,
}

impl HealthTracker {
    pub fn new(max_consecutive_failures: u32, backoff_cap: Duration) -> Self {
        Self {
            max_consecutive_failures,
            backoff_cap,
            consecutive_failures: 0,
            total_invocations: 0,
            total_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_failure_instant: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_invocations(&self) -> u64 {
        self.total_invocations
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Record a successful invocation. Resets the failure streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(Utc::now());
        self.total_invocations += 1;
    }

    /// Record an infrastructure failure (counts toward degradation).
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Utc::now());
        self.last_failure_instant = Some(Instant::now());
        self.total_failures += 1;
        self.total_invocations += 1;
    }

    /// Record a provider-domain failure (tool error, validation).
    ///
    /// Counts in the totals but not against the streak.
    pub fn record_invocation_failure(&mut self) {
        self.total_failures += 1;
        self.total_invocations += 1;
    }

    /// Record a passing health probe. Clears the streak without counting
    /// as an invocation.
    pub fn record_probe_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(Utc::now());
    }

    /// Whether the streak has reached the degradation threshold.
    pub fn should_degrade(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }

    /// Recovery backoff for the current streak: `min(cap, 2^streak)` seconds.
    pub fn backoff(&self) -> Duration {
        let exp = self.consecutive_failures.min(32);
        let raw = Duration::from_secs(1u64 << exp.min(20));
        raw.min(self.backoff_cap)
    }

    pub fn can_retry(&self) -> bool {
        match self.last_failure_instant {
            None => true,
            Some(at) => at.elapsed() >= self.backoff(),
        }
    }

    /// Seconds until a retry is allowed; zero when already allowed.
    pub fn time_until_retry(&self) -> f64 {
        match self.last_failure_instant {
            None => 0.0,
            Some(at) => {
                let backoff = self.backoff();
                let elapsed = at.elapsed();
                backoff.saturating_sub(elapsed).as_secs_f64()
            }
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_invocations == 0 {
            return 1.0;
        }
        (self.total_invocations - self.total_failures) as f64 / self.total_invocations as f64
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            consecutive_failures: self.consecutive_failures,
            total_invocations: self.total_invocations,
            total_failures: self.total_failures,
            success_rate: self.success_rate(),
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            can_retry: self.can_retry(),
            time_until_retry_s: self.time_until_retry(),
        }
    }
}

/// Read-only health view exposed through `details` / `health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub consecutive_failures: u32,
    pub total_invocations: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub can_retry: bool,
    pub time_until_retry_s: f64,
}
