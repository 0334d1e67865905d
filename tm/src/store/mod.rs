//! Durable storage for the queue and the credential pool
//!
//! Everything lives under one store directory:
//!
//! - `task_queue.json` - snapshot of active tasks
//! - `credentials.json` - credential cooldown state
//! - `archive.jsonl` - archived tasks, one per line
//! - `backups/` - pre-sweep copies of the queue snapshot
//! - `inbox/` - task definition files waiting to be ingested
//! - `.lock` - held by the single process that mutates the store

mod archive;
mod json;
mod lock;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use archive::{ArchiveSink, JsonlArchive};
pub use json::JsonFile;
pub use lock::StoreLock;

pub const QUEUE_FILE: &str = "task_queue.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const ARCHIVE_FILE: &str = "archive.jsonl";
pub const BACKUP_DIR: &str = "backups";
pub const INBOX_DIR: &str = "inbox";
pub const LOCK_FILE: &str = ".lock";

/// Errors from store I/O
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store {0} is locked by another process")]
    Locked(PathBuf),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Paths inside a store directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_file(&self) -> PathBuf {
        self.root.join(QUEUE_FILE)
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    pub fn archive_file(&self) -> PathBuf {
        self.root.join(ARCHIVE_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join(INBOX_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }
}
