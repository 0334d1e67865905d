//! Round-robin credential selection with cooldowns

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, add_duration, remaining};
use crate::store::{JsonFile, StoreError};

use super::config::RotationConfig;
use super::credential::{CallOutcome, CredentialState, CredentialStatus, ResourceCredential};
use super::error::RotationError;

/// Counters across the whole pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationStats {
    pub requests: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub errors: u64,
    pub unavailable: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialSnapshot {
    credentials: Vec<CredentialStatus>,
}

/// Read persisted credential state without the secrets
pub fn read_credential_snapshot(path: &Path) -> Result<Vec<CredentialStatus>, StoreError> {
    let file: JsonFile<CredentialSnapshot> = JsonFile::new(path);
    Ok(file.load()?.unwrap_or_default().credentials)
}

/// Internal state protected by mutex
struct PoolInner {
    credentials: Vec<ResourceCredential>,
    /// Index to try first on the next acquire
    cursor: usize,
    /// Bumped on every change worth persisting
    generation: u64,
    stats: RotationStats,
}

struct Persistence {
    file: JsonFile<CredentialSnapshot>,
    written: Mutex<u64>,
}

/// Pool of (key, model) credentials
///
/// `acquire` and `report_outcome` serialize on one mutex, which keeps the
/// round-robin cursor and the cooldown accounting consistent under
/// concurrent handlers.
pub struct ResourceRotationClient {
    config: RotationConfig,
    inner: Mutex<PoolInner>,
    clock: SharedClock,
    persistence: Option<Persistence>,
}

impl std::fmt::Debug for ResourceRotationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRotationClient")
            .field("config", &self.config)
            .field("credentials", &self.snapshot().len())
            .finish()
    }
}

impl ResourceRotationClient {
    /// Build the pool from labelled keys, pairing every key with every model
    ///
    /// Credentials are ordered model-major so consecutive picks land on
    /// different keys.
    pub fn new(
        keys: Vec<(String, String)>,
        config: RotationConfig,
        clock: SharedClock,
    ) -> Result<Self, RotationError> {
        debug!(keys = keys.len(), models = ?config.models, "ResourceRotationClient::new: called");
        if config.models.is_empty() {
            return Err(RotationError::NoModels);
        }
        if keys.is_empty() {
            return Err(RotationError::NoCredentials(config.api_key_env.clone()));
        }

        let credentials: Vec<ResourceCredential> = config
            .models
            .iter()
            .flat_map(|model| {
                keys.iter()
                    .map(move |(label, key)| ResourceCredential::new(label.clone(), key.clone(), model.clone()))
            })
            .collect();

        info!(credentials = credentials.len(), "Credential pool created");
        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                credentials,
                cursor: 0,
                generation: 0,
                stats: RotationStats::default(),
            }),
            clock,
            persistence: None,
        })
    }

    /// Build the pool from the comma-separated keys in `config.api_key_env`
    pub fn from_env(config: RotationConfig, clock: SharedClock) -> Result<Self, RotationError> {
        debug!(env = %config.api_key_env, "ResourceRotationClient::from_env: called");
        let raw = std::env::var(&config.api_key_env).unwrap_or_default();
        let keys = parse_keys(&raw);
        Self::new(keys, config, clock)
    }

    /// Persist cooldown state to `path`, restoring what is already there
    pub fn with_persistence(self, path: impl AsRef<Path>) -> Result<Self, RotationError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "ResourceRotationClient::with_persistence: called");
        let file: JsonFile<CredentialSnapshot> = JsonFile::new(path);

        match file.load() {
            Ok(Some(snapshot)) => {
                let mut inner = self.lock();
                let mut restored = 0;
                for saved in snapshot.credentials {
                    if let Some(cred) = inner.credentials.iter_mut().find(|c| c.id == saved.id) {
                        cred.state = saved.state;
                        cred.cooldown_until = saved.cooldown_until;
                        cred.failure_count = saved.failure_count;
                        cred.successes = saved.successes;
                        restored += 1;
                    }
                }
                info!(restored, "Restored credential state");
            }
            Ok(None) => debug!("ResourceRotationClient::with_persistence: no saved state"),
            Err(e) => warn!(error = %e, "Ignoring unreadable credential state"),
        }

        Ok(Self {
            persistence: Some(Persistence {
                file,
                written: Mutex::new(0),
            }),
            ..self
        })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the next Available credential in round-robin order
    ///
    /// Fails with `NoAvailableResource` when every credential is cooling or
    /// exhausted; `retry_after` is the wait until the earliest cooldown ends.
    pub fn acquire(self: &Arc<Self>) -> Result<Lease, RotationError> {
        debug!("ResourceRotationClient::acquire: called");
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.stats.requests += 1;

        let len = inner.credentials.len();
        let start = inner.cursor;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let cred = &mut inner.credentials[idx];
            if cred.refresh(now) {
                cred.in_flight += 1;
                let lease = Lease {
                    client: Arc::clone(self),
                    credential_id: cred.id.clone(),
                    model: cred.model.clone(),
                    api_key: cred.api_key().to_string(),
                    reported: false,
                };
                inner.cursor = (idx + 1) % len;
                debug!(credential = %lease.credential_id, "ResourceRotationClient::acquire: leased");
                return Ok(lease);
            }
        }

        inner.stats.unavailable += 1;
        let retry_after = inner
            .credentials
            .iter()
            .filter(|c| c.state == CredentialState::Cooling)
            .filter_map(|c| c.cooldown_until)
            .min()
            .map(|until| remaining(now, until));
        debug!(?retry_after, "ResourceRotationClient::acquire: no available credential");
        Err(RotationError::NoAvailableResource { retry_after })
    }

    /// Record the result of a call made with `credential_id`
    pub fn report_outcome(&self, credential_id: &str, outcome: CallOutcome) -> Result<(), RotationError> {
        debug!(%credential_id, ?outcome, "ResourceRotationClient::report_outcome: called");
        let now = self.clock.now();
        let snapshot = {
            let mut inner = self.lock();
            let idx = inner
                .credentials
                .iter()
                .position(|c| c.id == credential_id)
                .ok_or_else(|| RotationError::UnknownCredential(credential_id.to_string()))?;

            let changed = match outcome {
                CallOutcome::Success => {
                    inner.stats.successes += 1;
                    let cred = &mut inner.credentials[idx];
                    cred.successes += 1;
                    let changed = cred.failure_count > 0 || cred.state != CredentialState::Available;
                    cred.clear();
                    changed
                }
                CallOutcome::RateLimited { retry_after } => {
                    inner.stats.rate_limited += 1;
                    self.cool_down(&mut inner.credentials[idx], retry_after, now);
                    true
                }
                CallOutcome::QuotaExceeded => {
                    inner.stats.rate_limited += 1;
                    self.cool_down(&mut inner.credentials[idx], None, now);
                    true
                }
                CallOutcome::Rejected => {
                    inner.stats.errors += 1;
                    let cred = &mut inner.credentials[idx];
                    cred.state = CredentialState::Exhausted;
                    cred.cooldown_until = None;
                    warn!(credential = %cred.id, "Credential rejected, marked exhausted");
                    true
                }
                CallOutcome::TransientError => {
                    inner.stats.errors += 1;
                    false
                }
            };

            if changed {
                inner.generation += 1;
                Some(self.persisted_form(&inner))
            } else {
                None
            }
        };

        if let Some((generation, snapshot)) = snapshot {
            self.persist(generation, snapshot);
        }
        Ok(())
    }

    fn cool_down(
        &self,
        cred: &mut ResourceCredential,
        hint: Option<Duration>,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let backoff = self.config.cooldown(cred.failure_count);
        cred.failure_count += 1;
        if cred.failure_count >= self.config.exhaustion_ceiling {
            cred.state = CredentialState::Exhausted;
            cred.cooldown_until = None;
            warn!(
                credential = %cred.id,
                failures = cred.failure_count,
                "Credential exhausted after repeated rate limits"
            );
            return;
        }

        let wait = hint.map_or(backoff, |h| h.max(backoff).min(Duration::from_millis(self.config.cooldown_max_ms)));
        cred.state = CredentialState::Cooling;
        cred.cooldown_until = Some(add_duration(now, wait));
        info!(credential = %cred.id, failures = cred.failure_count, ?wait, "Credential cooling down");
    }

    /// Return a credential to Available and clear its failures
    pub fn reset(&self, credential_id: &str) -> Result<(), RotationError> {
        debug!(%credential_id, "ResourceRotationClient::reset: called");
        let (generation, snapshot) = {
            let mut inner = self.lock();
            let cred = inner
                .credentials
                .iter_mut()
                .find(|c| c.id == credential_id)
                .ok_or_else(|| RotationError::UnknownCredential(credential_id.to_string()))?;
            cred.clear();
            inner.generation += 1;
            self.persisted_form(&inner)
        };
        self.persist(generation, snapshot);
        info!(%credential_id, "Credential reset");
        Ok(())
    }

    /// Reset every cooling or exhausted credential; returns how many
    pub fn reset_all(&self) -> usize {
        debug!("ResourceRotationClient::reset_all: called");
        let (count, generation, snapshot) = {
            let mut inner = self.lock();
            let mut count = 0;
            for cred in inner
                .credentials
                .iter_mut()
                .filter(|c| c.state != CredentialState::Available || c.failure_count > 0)
            {
                cred.clear();
                count += 1;
            }
            inner.generation += 1;
            let (generation, snapshot) = self.persisted_form(&inner);
            (count, generation, snapshot)
        };
        self.persist(generation, snapshot);
        info!(count, "Credentials reset");
        count
    }

    /// Status of every credential, secrets omitted
    pub fn snapshot(&self) -> Vec<CredentialStatus> {
        self.lock().credentials.iter().map(ResourceCredential::status).collect()
    }

    pub fn stats(&self) -> RotationStats {
        self.lock().stats.clone()
    }

    fn persisted_form(&self, inner: &PoolInner) -> (u64, CredentialSnapshot) {
        let credentials = inner.credentials.iter().map(ResourceCredential::status).collect();
        (inner.generation, CredentialSnapshot { credentials })
    }

    /// Write a snapshot unless a newer one already landed
    fn persist(&self, generation: u64, snapshot: CredentialSnapshot) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let mut written = persistence.written.lock().unwrap_or_else(|e| e.into_inner());
        if generation <= *written {
            debug!(generation, written = *written, "ResourceRotationClient::persist: stale snapshot skipped");
            return;
        }
        match persistence.file.save(&snapshot) {
            Ok(()) => *written = generation,
            Err(e) => warn!(error = %e, "Failed to persist credential state"),
        }
    }

    fn release(&self, credential_id: &str) {
        let mut inner = self.lock();
        if let Some(cred) = inner.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.in_flight = cred.in_flight.saturating_sub(1);
        }
    }
}

/// Split a comma-separated key list into labelled keys
fn parse_keys(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .enumerate()
        .map(|(i, key)| (format!("key-{}", i + 1), key.to_string()))
        .collect()
}

/// A credential checked out for one call
///
/// Dropping the lease releases it; `report` records the call's outcome first.
pub struct Lease {
    client: Arc<ResourceRotationClient>,
    credential_id: String,
    model: String,
    api_key: String,
    reported: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("credential_id", &self.credential_id)
            .field("model", &self.model)
            .field("reported", &self.reported)
            .finish()
    }
}

impl Lease {
    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Report the call's outcome and release the credential
    pub fn report(mut self, outcome: CallOutcome) {
        self.reported = true;
        if let Err(e) = self.client.report_outcome(&self.credential_id, outcome) {
            warn!(error = %e, "Failed to report credential outcome");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.reported {
            debug!(credential = %self.credential_id, "Lease::drop: released without a report");
        }
        self.client.release(&self.credential_id);
    }
}
