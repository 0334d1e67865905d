//! Resource rotation
//!
//! Spreads external calls across a pool of (API key, model) credentials.
//! Rate-limited credentials cool down with exponential backoff; repeated
//! limits exhaust a credential until it is reset from outside.

mod client;
mod config;
mod credential;
mod error;

pub use client::{Lease, ResourceRotationClient, RotationStats, read_credential_snapshot};
pub use config::RotationConfig;
pub use credential::{CallOutcome, CredentialState, CredentialStatus, ResourceCredential};
pub use error::RotationError;
