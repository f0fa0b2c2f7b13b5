//! Crash-restart back-off policy

use std::time::Duration;

/// Exponential back-off for crash-triggered restarts.
///
/// Attempt `n` (0-indexed) waits `base * 2^n`, capped at `max_delay`; after
/// `max_attempts` the policy yields `None` and the module is parked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartBackoff {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the retry delay
    pub max_delay: Duration,
    /// Maximum number of restart attempts
    pub max_attempts: u32,
}

impl RestartBackoff {
    /// Builds a policy from launch settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before a specific attempt (0-indexed), or `None` when retries
    /// are exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let multiplier = 2u64.saturating_pow(attempt);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(multiplier);
        Some(Duration::from_millis(delay_ms).min(self.max_delay))
    }
}

impl Default for RestartBackoff {
    /// Default: 5 attempts at 500ms/1s/2s/4s/8s, capped at 30s.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}
