//! TaskHandler trait and the errors handlers return

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a handler invocation failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No available resource (retry after {retry_after:?})")]
    NoAvailableResource { retry_after: Option<Duration> },

    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),
}

/// How the dispatcher treats a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Fatal,
    /// The handler never reached its external call
    Deferred(Option<Duration>),
}

impl HandlerError {
    /// Classification by error kind
    pub fn default_class(&self) -> FailureClass {
        match self {
            HandlerError::Timeout(_)
            | HandlerError::RateLimited { .. }
            | HandlerError::TransientIo(_)
            | HandlerError::Retryable(_) => FailureClass::Retryable,
            HandlerError::MalformedPayload(_) | HandlerError::PermissionDenied(_) | HandlerError::Fatal(_) => {
                FailureClass::Fatal
            }
            HandlerError::NoAvailableResource { retry_after } => FailureClass::Deferred(*retry_after),
        }
    }
}

/// Per-invocation context handed to a handler
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled on shutdown or when the deadline passes
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl HandlerContext {
    pub fn new(task_id: impl Into<String>, attempt: u32, cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A unit of work bound to one or more `(kind, subtype)` routing keys
///
/// Handlers are built by the registry and shared across concurrent
/// invocations, so they must not hold per-task state.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt against the task payload
    async fn execute(&self, ctx: &HandlerContext, payload: &Value) -> Result<Value, HandlerError>;

    /// Decide whether a failure is worth another attempt
    fn classify(&self, err: &HandlerError) -> FailureClass {
        err.default_class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classification() {
        assert_eq!(
            HandlerError::Timeout("slow".into()).default_class(),
            FailureClass::Retryable
        );
        assert_eq!(
            HandlerError::RateLimited { retry_after: None }.default_class(),
            FailureClass::Retryable
        );
        assert_eq!(
            HandlerError::TransientIo("reset".into()).default_class(),
            FailureClass::Retryable
        );
        assert_eq!(
            HandlerError::MalformedPayload("no prompt".into()).default_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            HandlerError::PermissionDenied("ro".into()).default_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            HandlerError::NoAvailableResource {
                retry_after: Some(Duration::from_secs(3))
            }
            .default_class(),
            FailureClass::Deferred(Some(Duration::from_secs(3)))
        );
    }

    #[tokio::test]
    async fn test_context_remaining_counts_down() {
        let ctx = HandlerContext::new("t-1", 1, CancellationToken::new(), Duration::from_secs(60));
        assert!(ctx.remaining() <= Duration::from_secs(60));
        assert!(ctx.remaining() > Duration::from_secs(50));
        assert!(!ctx.is_cancelled());
    }
}
