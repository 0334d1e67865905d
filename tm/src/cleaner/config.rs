//! Retention configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a task leaving active storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    /// Append to the archive sink first
    Archive,
    /// Drop it
    Delete,
}

/// Cleaner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Finished tasks older than this are swept
    #[serde(rename = "max-age-days")]
    pub max_age_days: u64,

    pub mode: RetentionMode,

    /// Copy the queue snapshot to `backups/` before a non-empty sweep
    pub backup: bool,

    /// Supervisor cycles between sweeps
    #[serde(rename = "sweep-every")]
    pub sweep_every: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_age_days: 7,
            mode: RetentionMode::Archive,
            backup: true,
            sweep_every: 10,
        }
    }
}

impl CleanerConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: Duration::from_secs(self.max_age_days.saturating_mul(24 * 60 * 60)),
            mode: self.mode,
            backup: self.backup,
        }
    }
}

/// One sweep's rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub mode: RetentionMode,
    pub backup: bool,
}
