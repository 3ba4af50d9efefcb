//! Retry policy value object.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy applied by channel dispatchers to transient delivery failures.
///
/// `max_attempts` counts every send attempt including the first one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to spread retries by up to ±25%.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    60 * 60 * 1000
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Backoff to apply after `attempts` attempts have been made.
    ///
    /// `base × 2^(attempts-1)`, capped at `max_delay_ms`.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);

        if self.use_jitter && delay_ms > 0 {
            let jitter_range = delay_ms / 4;
            let jitter = if jitter_range > 0 {
                (rand::random::<u64>() % (jitter_range * 2)) as i64 - jitter_range as i64
            } else {
                0
            };
            let jittered = (delay_ms as i64 + jitter).max(0) as u64;
            Duration::from_millis(jittered.min(self.max_delay_ms))
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    /// Whether another attempt is allowed once `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: default_true(),
        }
    }
}
