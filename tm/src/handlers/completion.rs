//! Completion handler over the credential pool

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatcher::{HandlerContext, HandlerError, TaskHandler};
use crate::rotation::{CallOutcome, ResourceRotationClient, RotationError};

use super::cache::{CacheStats, CachedResponse, ResponseCache};

/// Failure of one backend call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Quota exceeded")]
    QuotaExceeded,

    /// The credential was refused
    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Transient error: {0}")]
    Transient(String),

    /// The request itself was bad; retrying will not help
    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// Something that turns a prompt into text using one credential
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, api_key: &str, model: &str, prompt: &str) -> Result<String, BackendError>;
}

/// Sends the task's prompt to a backend with a leased credential
pub struct CompletionHandler {
    backend: Arc<dyn CompletionBackend>,
    rotation: Arc<ResourceRotationClient>,
    cache: Option<ResponseCache>,
}

impl CompletionHandler {
    pub fn new(backend: Arc<dyn CompletionBackend>, rotation: Arc<ResourceRotationClient>) -> Self {
        Self {
            backend,
            rotation,
            cache: None,
        }
    }

    /// Answer repeated prompts from a cache of the last `capacity` responses
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = (capacity > 0).then(|| ResponseCache::new(capacity));
        self
    }

    /// Cache counters, if caching is on
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(ResponseCache::stats)
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }
}

/// `payload.prompt`, or a prompt built from `payload.description` and the
/// remaining fields
fn build_prompt(payload: &Value) -> Result<String, HandlerError> {
    if let Some(prompt) = payload["prompt"].as_str().filter(|p| !p.trim().is_empty()) {
        return Ok(prompt.to_string());
    }
    let description = payload["description"]
        .as_str()
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| HandlerError::MalformedPayload("prompt or description is required".to_string()))?;

    let mut context = payload.as_object().cloned().unwrap_or_default();
    context.remove("description");
    if context.is_empty() {
        return Ok(description.to_string());
    }
    let context = serde_json::to_string_pretty(&Value::Object(context))
        .map_err(|e| HandlerError::MalformedPayload(e.to_string()))?;
    Ok(format!("{}\n\nContext:\n{}", description, context))
}

#[async_trait]
impl TaskHandler for CompletionHandler {
    async fn execute(&self, ctx: &HandlerContext, payload: &Value) -> Result<Value, HandlerError> {
        debug!(task_id = %ctx.task_id, attempt = ctx.attempt, "CompletionHandler::execute: called");
        let prompt = build_prompt(payload)?;

        if let Some(cached) = self.cache.as_ref().and_then(|cache| cache.get(&prompt)) {
            debug!(task_id = %ctx.task_id, credential = %cached.credential, "CompletionHandler::execute: cache hit");
            return Ok(json!({
                "model": cached.model,
                "credential": cached.credential,
                "text": cached.text,
                "cached": true,
            }));
        }

        let lease = self.rotation.acquire().map_err(|e| match e {
            RotationError::NoAvailableResource { retry_after } => HandlerError::NoAvailableResource { retry_after },
            other => HandlerError::Fatal(other.to_string()),
        })?;
        let credential = lease.credential_id().to_string();
        let model = lease.model().to_string();
        debug!(task_id = %ctx.task_id, %credential, "CompletionHandler::execute: leased");

        let result = tokio::select! {
            result = self.backend.complete(lease.api_key(), &model, &prompt) => result,
            _ = ctx.cancel.cancelled() => {
                // Dropping the lease releases it without blaming the credential
                return Err(HandlerError::Timeout("completion cancelled".to_string()));
            }
        };

        match result {
            Ok(text) => {
                lease.report(CallOutcome::Success);
                if let Some(cache) = &self.cache {
                    cache.insert(
                        &prompt,
                        CachedResponse {
                            model: model.clone(),
                            credential: credential.clone(),
                            text: text.clone(),
                        },
                    );
                }
                Ok(json!({
                    "model": model,
                    "credential": credential,
                    "text": text,
                }))
            }
            Err(BackendError::RateLimited { retry_after }) => {
                lease.report(CallOutcome::RateLimited { retry_after });
                Err(HandlerError::RateLimited { retry_after })
            }
            Err(BackendError::QuotaExceeded) => {
                lease.report(CallOutcome::QuotaExceeded);
                Err(HandlerError::RateLimited { retry_after: None })
            }
            Err(BackendError::Rejected(reason)) => {
                warn!(%credential, "Backend rejected credential");
                lease.report(CallOutcome::Rejected);
                Err(HandlerError::Retryable(format!("credential {} rejected: {}", credential, reason)))
            }
            Err(BackendError::Transient(reason)) => {
                lease.report(CallOutcome::TransientError);
                Err(HandlerError::TransientIo(reason))
            }
            Err(BackendError::Invalid(reason)) => {
                drop(lease);
                Err(HandlerError::Fatal(format!("backend refused request: {}", reason)))
            }
        }
    }
}
