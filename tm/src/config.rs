//! taskmill configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cleaner::CleanerConfig;
use crate::daemon::WatchdogConfig;
use crate::dispatcher::DispatcherConfig;
use crate::handlers::default_wiring;
use crate::queue::QueueConfig;
use crate::registry::ModuleSpec;
use crate::rotation::RotationConfig;
use crate::supervisor::SupervisorConfig;

/// Main taskmill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Retry budget and backoff for tasks
    pub queue: QueueConfig,

    /// Handler pool limits
    pub dispatcher: DispatcherConfig,

    /// Credential pool and Gemini backend
    pub rotation: RotationConfig,

    /// Retention of finished tasks
    pub cleaner: CleanerConfig,

    /// Pacing of the improvement loop
    pub supervisor: SupervisorConfig,

    /// Restart policy for the daemon process
    pub watchdog: WatchdogConfig,

    /// Module wiring, resolved once at startup
    pub modules: Vec<ModuleSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: None,
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            rotation: RotationConfig::default(),
            cleaner: CleanerConfig::default(),
            supervisor: SupervisorConfig::default(),
            watchdog: WatchdogConfig::default(),
            modules: default_wiring(),
        }
    }
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(eyre::eyre!("queue.max-attempts must be at least 1"));
        }
        if self.dispatcher.max_concurrent == 0 {
            return Err(eyre::eyre!("dispatcher.max-concurrent must be at least 1"));
        }
        if self.rotation.models.is_empty() {
            return Err(eyre::eyre!("rotation.models must list at least one model"));
        }
        if self.rotation.exhaustion_ceiling == 0 {
            return Err(eyre::eyre!("rotation.exhaustion-ceiling must be at least 1"));
        }
        if self.supervisor.min_pause_ms > self.supervisor.max_pause_ms {
            return Err(eyre::eyre!(
                "supervisor.min-pause-ms ({}) exceeds supervisor.max-pause-ms ({})",
                self.supervisor.min_pause_ms,
                self.supervisor.max_pause_ms
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidate_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => Some(path.clone()),
            None => Self::candidate_paths().into_iter().find(|p| p.exists()),
        }?;

        #[derive(Deserialize)]
        struct LevelOnly {
            #[serde(rename = "log-level")]
            log_level: Option<String>,
        }

        let content = fs::read_to_string(path).ok()?;
        serde_yaml::from_str::<LevelOnly>(&content).ok()?.log_level
    }

    /// Project-local `.taskmill.yml`, then `~/.config/taskmill/taskmill.yml`
    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".taskmill.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("taskmill").join("taskmill.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the queue snapshot, credentials, archive and inbox
    #[serde(rename = "store-dir")]
    pub store_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/taskmill/store on Linux)
        let store_dir = dirs::data_local_dir()
            .map(|d| d.join("taskmill").join("store"))
            .unwrap_or_else(|| PathBuf::from(".taskmill"));

        Self { store_dir }
    }
}
