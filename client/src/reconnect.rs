//! Reconnection policy: bounded exponential backoff over a finite number of attempts.
//!
use std::time::Duration;

use serde::Deserialize;

/// Configuration for reconnection behavior
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before giving up and moving to `Failed`
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay_ms: u64,
    /// Ceiling for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts (2.0 doubles)
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before the (1-based) `attempt`.
    ///
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let delay = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// All delays, in order.
    ///
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|n| self.delay(n))
    }
}
