//! Reconnect backoff for CM connections.
//!
//! After a non-user disconnect the connection worker sleeps for
//! [`ReconnectPolicy::backoff`] before dialing the next directory candidate. Attempts
//! repeat indefinitely unless `max_attempts` is set.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a non-user disconnect (default: true).
    pub enabled: bool,
    /// Delay before the first retry in milliseconds (default: 1000).
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay in milliseconds (default: 30000).
    pub max_backoff_ms: u64,
    /// Growth factor per consecutive failure (default: 2.0).
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter (default: true).
    pub jitter: bool,
    /// Stop after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// Computes `initial_backoff * backoff_multiplier^attempt`, capped at `max_backoff`,
    /// plus 0-50% jitter when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_backoff_ms as f64;
        let max_delay_ms = self.max_backoff_ms as f64;
        let computed = base_delay_ms * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = computed.min(max_delay_ms).max(0.0) as u64;

        if self.jitter && capped >= 2 {
            let jitter_ms = rand::thread_rng().gen_range(0..capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| failures < max)
    }
}
