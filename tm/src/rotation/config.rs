//! Rotation configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Credential pool and backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Environment variable holding comma-separated API keys
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Models to rotate through, each paired with every key
    pub models: Vec<String>,

    /// Cooldown after the first rate limit
    #[serde(rename = "cooldown-base-ms")]
    pub cooldown_base_ms: u64,

    /// Upper bound on a single cooldown
    #[serde(rename = "cooldown-max-ms")]
    pub cooldown_max_ms: u64,

    /// Consecutive rate limits before a credential is exhausted
    #[serde(rename = "exhaustion-ceiling")]
    pub exhaustion_ceiling: u32,

    /// API base URL for the completion backend
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            api_key_env: "GOOGLE_API_KEY".to_string(),
            models: vec!["gemini-2.0-flash".to_string(), "gemini-1.5-flash".to_string()],
            cooldown_base_ms: 2_000,
            cooldown_max_ms: 10_000,
            exhaustion_ceiling: 5,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            timeout_ms: 60_000,
        }
    }
}

impl RotationConfig {
    /// Cooldown for a credential that had `failures` prior consecutive limits
    pub fn cooldown(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.min(32);
        Duration::from_millis(self.cooldown_base_ms.saturating_mul(factor).min(self.cooldown_max_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
