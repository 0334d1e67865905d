//! Queue configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget and backoff curve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts before a retryable failure becomes final
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(rename = "retry-base-ms")]
    pub retry_base_ms: u64,

    /// Upper bound on the retry delay
    #[serde(rename = "retry-max-ms")]
    pub retry_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 2_000,
            retry_max_ms: 60_000,
        }
    }
}

impl QueueConfig {
    /// Delay after the given attempt failed: base * 2^(attempt-1), capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor).min(self.retry_max_ms))
    }
}
