//! Credential records and call outcomes

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Selection state of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    Cooling,
    /// Terminal until reset
    Exhausted,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialState::Available => "available",
            CredentialState::Cooling => "cooling",
            CredentialState::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// What happened on a call made with a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// HTTP 429 or equivalent; `retry_after` is the server's hint
    RateLimited { retry_after: Option<Duration> },
    QuotaExceeded,
    /// Key revoked or not authorized
    Rejected,
    /// Network or server error unrelated to this credential's limits
    TransientError,
}

/// One (API key, model) pair in the pool
#[derive(Clone)]
pub struct ResourceCredential {
    pub id: String,
    pub key_label: String,
    pub model: String,
    api_key: String,
    pub state: CredentialState,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub successes: u64,
    pub in_flight: u32,
}

impl fmt::Debug for ResourceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCredential")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("state", &self.state)
            .field("cooldown_until", &self.cooldown_until)
            .field("failure_count", &self.failure_count)
            .finish()
    }
}

impl ResourceCredential {
    pub fn new(key_label: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let key_label = key_label.into();
        let model = model.into();
        Self {
            id: format!("{}/{}", key_label, model),
            key_label,
            model,
            api_key: api_key.into(),
            state: CredentialState::Available,
            cooldown_until: None,
            failure_count: 0,
            successes: 0,
            in_flight: 0,
        }
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Available now, moving an expired cooldown back to Available
    pub(crate) fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == CredentialState::Cooling && self.cooldown_until.is_none_or(|until| until <= now) {
            self.state = CredentialState::Available;
            self.cooldown_until = None;
        }
        self.state == CredentialState::Available
    }

    pub(crate) fn clear(&mut self) {
        self.state = CredentialState::Available;
        self.cooldown_until = None;
        self.failure_count = 0;
    }

    pub fn status(&self) -> CredentialStatus {
        CredentialStatus {
            id: self.id.clone(),
            model: self.model.clone(),
            state: self.state,
            cooldown_until: self.cooldown_until,
            failure_count: self.failure_count,
            successes: self.successes,
            in_flight: self.in_flight,
        }
    }
}

/// Credential state without the secret; also the persisted form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub id: String,
    pub model: String,
    pub state: CredentialState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub successes: u64,
    #[serde(default, skip_serializing)]
    pub in_flight: u32,
}
