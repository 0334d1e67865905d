//! Cold storage for archived tasks

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::StoreError;
use crate::domain::Task;

/// Destination for tasks removed from active storage
pub trait ArchiveSink: std::fmt::Debug + Send + Sync {
    /// Durably record one archived task
    fn store(&self, task: &Task) -> Result<(), StoreError>;
}

/// Append-only JSON Lines archive
#[derive(Debug)]
pub struct JsonlArchive {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every archived task back
    pub fn read_all(&self) -> Result<Vec<Task>, StoreError> {
        debug!(path = %self.path.display(), "JsonlArchive::read_all: called");
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut tasks = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let task = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

impl ArchiveSink for JsonlArchive {
    fn store(&self, task: &Task) -> Result<(), StoreError> {
        debug!(id = %task.id, path = %self.path.display(), "JsonlArchive::store: called");
        let mut line = serde_json::to_string(task)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskKind, TaskState};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_archive_appends_lines() {
        let temp = tempdir().unwrap();
        let archive = JsonlArchive::new(temp.path().join("archive.jsonl"));

        let mut first = Task::new(TaskKind::Analysis, None, 0, json!({}), Utc::now(), 1);
        first.state = TaskState::Archived;
        let mut second = Task::new(TaskKind::Test, None, 0, json!({}), Utc::now(), 2);
        second.state = TaskState::Archived;

        archive.store(&first).unwrap();
        archive.store(&second).unwrap();

        let back = archive.read_all().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].id, first.id);
        assert_eq!(back[1].id, second.id);
    }

    #[test]
    fn test_read_all_missing_file_is_empty() {
        let temp = tempdir().unwrap();
        let archive = JsonlArchive::new(temp.path().join("none.jsonl"));
        assert!(archive.read_all().unwrap().is_empty());
    }
}
