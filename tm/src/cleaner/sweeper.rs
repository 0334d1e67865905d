//! TaskCleaner - retention sweeps over the active queue

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::domain::Task;
use crate::queue::{QueueError, TaskFilter, TaskQueue};
use crate::store::{ArchiveSink, StoreError};

use super::config::{RetentionMode, RetentionPolicy};

/// Tasks shown by a preview
const PREVIEW_SAMPLE: usize = 5;

/// Errors that abort a whole sweep
#[derive(Debug, Error)]
pub enum CleanerError {
    #[error("Failed to list tasks: {0}")]
    Queue(#[from] QueueError),

    #[error("Backup failed, sweep skipped: {0}")]
    Backup(#[source] StoreError),
}

/// What a sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Tasks past the retention window
    pub scanned: usize,
    pub archived: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// What a sweep would do
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepPreview {
    pub total: usize,
    pub to_archive: usize,
    pub to_keep: usize,
    pub sample: Vec<Task>,
}

/// Retention sweeper
pub struct TaskCleaner {
    queue: TaskQueue,
    sink: Arc<dyn ArchiveSink>,
    backup_dir: PathBuf,
    clock: SharedClock,
}

impl std::fmt::Debug for TaskCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCleaner")
            .field("queue", &self.queue)
            .field("backup_dir", &self.backup_dir)
            .finish()
    }
}

impl TaskCleaner {
    pub fn new(
        queue: TaskQueue,
        sink: Arc<dyn ArchiveSink>,
        backup_dir: impl Into<PathBuf>,
        clock: SharedClock,
    ) -> Self {
        let backup_dir = backup_dir.into();
        debug!(backup_dir = %backup_dir.display(), "TaskCleaner::new: called");
        Self {
            queue,
            sink,
            backup_dir,
            clock,
        }
    }

    async fn candidates(&self, policy: &RetentionPolicy) -> Result<Vec<Task>, QueueError> {
        let cutoff = chrono::Duration::from_std(policy.max_age)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        self.queue.list(TaskFilter::terminal_before(cutoff)).await
    }

    /// Remove Succeeded and Failed tasks that finished before the window
    ///
    /// A task that cannot be archived stays in the queue and is counted in
    /// `failed`; the sweep moves on to the next one.
    pub async fn sweep(&self, policy: &RetentionPolicy) -> Result<SweepReport, CleanerError> {
        debug!(?policy, "TaskCleaner::sweep: called");
        let candidates = self.candidates(policy).await?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            debug!("TaskCleaner::sweep: nothing to sweep");
            return Ok(report);
        }

        if policy.backup {
            report.backup = self.backup().map_err(CleanerError::Backup)?;
        }

        for task in candidates {
            match self.remove(&task, policy.mode).await {
                Ok(()) => report.archived += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to sweep task");
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            archived = report.archived,
            failed = report.failed,
            "Sweep finished"
        );
        Ok(report)
    }

    async fn remove(&self, task: &Task, mode: RetentionMode) -> Result<(), QueueError> {
        debug!(task_id = %task.id, ?mode, "TaskCleaner::remove: called");
        match mode {
            RetentionMode::Archive => self.queue.archive_into(&task.id, Arc::clone(&self.sink)).await?,
            RetentionMode::Delete => self.queue.archive(&task.id).await?,
        };
        Ok(())
    }

    /// Count what `sweep` would remove without touching anything
    pub async fn preview(&self, policy: &RetentionPolicy) -> Result<SweepPreview, CleanerError> {
        debug!(?policy, "TaskCleaner::preview: called");
        let total = self.queue.list(TaskFilter::default()).await?.len();
        let candidates = self.candidates(policy).await?;
        Ok(SweepPreview {
            total,
            to_archive: candidates.len(),
            to_keep: total.saturating_sub(candidates.len()),
            sample: candidates.into_iter().take(PREVIEW_SAMPLE).collect(),
        })
    }

    /// Copy the queue snapshot into the backup directory
    fn backup(&self) -> Result<Option<PathBuf>, StoreError> {
        let source = self.queue.store_path();
        if !source.exists() {
            debug!("TaskCleaner::backup: no snapshot to back up");
            return Ok(None);
        }
        std::fs::create_dir_all(&self.backup_dir).map_err(|e| StoreError::io(&self.backup_dir, e))?;
        let target = backup_path(&self.backup_dir, source, self.clock.now());
        std::fs::copy(source, &target).map_err(|e| StoreError::io(&target, e))?;
        info!(path = %target.display(), "Backed up task queue");
        Ok(Some(target))
    }
}

fn backup_path(dir: &Path, source: &Path, at: chrono::DateTime<chrono::Utc>) -> PathBuf {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("task_queue");
    dir.join(format!("{}-{}.json", stem, at.format("%Y%m%dT%H%M%S%3fZ")))
}
