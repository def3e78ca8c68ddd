//! Restart policy: exponential backoff with a sliding-failure circuit breaker

use crate::config::RestartConfig;
use std::time::{Duration, Instant};

/// What to do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after the delay
    Restart { delay: Duration, attempt: u32 },
    /// Stop restarting until an operator intervenes
    Open { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_failures: u32,
    pub instability_window: Duration,
    pub stability_window: Duration,
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_failures: config.max_failures.max(1),
            instability_window: Duration::from_secs(config.instability_window_secs),
            stability_window: Duration::from_secs(config.stability_window_secs),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

impl RestartPolicy {
    /// `min(base * 2^attempts, cap)`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Per-service failure bookkeeping
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    attempts: u32,
    first_failure_at: Option<Instant>,
    open: bool,
}

impl CircuitBreaker {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Count a failure observed at `now` and decide on the restart
    pub fn record_failure(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        if self.open {
            return RestartDecision::Open { failures: self.attempts };
        }

        // Failures outside the instability window start a new streak
        if let Some(first) = self.first_failure_at {
            if now.saturating_duration_since(first) > policy.instability_window {
                self.attempts = 0;
                self.first_failure_at = None;
            }
        }

        let failures = self.attempts + 1;
        if self.first_failure_at.is_none() {
            self.first_failure_at = Some(now);
        }

        if failures >= policy.max_failures {
            self.attempts = failures;
            self.open = true;
            return RestartDecision::Open { failures };
        }

        let delay = policy.delay_for(self.attempts);
        self.attempts = failures;
        RestartDecision::Restart { delay, attempt: failures }
    }

    /// The process stayed healthy for the stability window
    pub fn record_stable(&mut self) {
        self.attempts = 0;
        self.first_failure_at = None;
    }

    /// Operator stop/restart: forget everything, including an open breaker
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
