//! Exclusive ownership of a store directory

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use super::{LOCK_FILE, StoreError};

/// Advisory lock held for as long as the value lives
///
/// Only the lock holder may mutate the queue and credential files.
/// Readers (status commands) can still read the snapshots.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Take the lock without waiting
    pub fn acquire(store_dir: &Path) -> Result<Self, StoreError> {
        debug!(store_dir = %store_dir.display(), "StoreLock::acquire: called");
        fs::create_dir_all(store_dir).map_err(|e| StoreError::io(store_dir, e))?;
        let path = store_dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            debug!("StoreLock::acquire: lock held elsewhere");
            return Err(StoreError::Locked(store_dir.to_path_buf()));
        }

        file.set_len(0).map_err(|e| StoreError::io(&path, e))?;
        write!(file, "{}", std::process::id()).map_err(|e| StoreError::io(&path, e))?;

        info!(path = %path.display(), "Store lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "StoreLock::drop: releasing");
        let _ = FileExt::unlock(&self.file);
    }
}
