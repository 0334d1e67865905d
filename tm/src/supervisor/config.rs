//! Supervisor configuration

use serde::{Deserialize, Serialize};

/// Pacing of the supervisor loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Pause after the first cycle
    #[serde(rename = "initial-pause-ms")]
    pub initial_pause_ms: u64,

    #[serde(rename = "min-pause-ms")]
    pub min_pause_ms: u64,

    #[serde(rename = "max-pause-ms")]
    pub max_pause_ms: u64,

    /// Consecutive failing cycles tolerated before the pause widens
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_pause_ms: 30_000,
            min_pause_ms: 5_000,
            max_pause_ms: 600_000,
            failure_threshold: 3,
        }
    }
}
