//! Rotation errors

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RotationError {
    /// Every credential is cooling or exhausted; try again later
    #[error("No available resource (retry after {retry_after:?})")]
    NoAvailableResource { retry_after: Option<Duration> },

    #[error("No API keys found in environment variable {0}")]
    NoCredentials(String),

    #[error("No models configured")]
    NoModels,

    #[error("Unknown credential: {0}")]
    UnknownCredential(String),
}

impl RotationError {
    /// Exhaustion is a wait, not a failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, RotationError::NoAvailableResource { .. })
    }
}
