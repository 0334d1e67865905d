//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Handler pool limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Handler invocations allowed to run at once
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    /// Upper bound on a single handler invocation
    #[serde(rename = "handler-timeout-ms")]
    pub handler_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            handler_timeout_ms: 120_000,
        }
    }
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}
