use std::time::Duration;

use chunkferry_protocol::constants::{
    CHUNK_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY,
};
use serde::{Deserialize, Serialize};

/// Per-chunk retry behaviour.
///
/// After failed attempt `k` (1-based) the scheduler waits `k * base_delay`
/// before the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            attempt_timeout_secs: CHUNK_ATTEMPT_TIMEOUT.as_secs(),
        }
    }
}

impl RetryPolicy {
    /// Attempts per chunk, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}
