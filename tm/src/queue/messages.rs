//! Task queue messages
//!
//! Commands and responses for the actor pattern.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::domain::{DefinitionError, Task, TaskDefinition, TaskKind, TaskState};
use crate::store::ArchiveSink;

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid task: {0}")]
    InvalidTask(#[from] DefinitionError),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {id} is {state}, not running")]
    NotRunning { id: String, state: TaskState },

    #[error("Task {id} is {state}, not terminal")]
    NotTerminal { id: String, state: TaskState },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from queue operations
pub type QueueResponse<T> = Result<T, QueueError>;

/// Result of one attempt, as reported by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Handler finished; the value is kept on the task
    Succeeded(Value),

    /// Worth another attempt while the budget lasts
    Retryable(String),

    /// No retry
    Fatal(String),

    /// No resource was available. With `retry_after` the attempt does not
    /// count; without it the outcome is handled like `Retryable`.
    Deferred { reason: String, retry_after: Option<Duration> },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded(_) => "succeeded",
            TaskOutcome::Retryable(_) => "retryable",
            TaskOutcome::Fatal(_) => "fatal",
            TaskOutcome::Deferred { .. } => "deferred",
        }
    }
}

/// Selection for `list`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Any of these states; empty matches all
    pub states: Vec<TaskState>,
    pub kind: Option<TaskKind>,
    /// Only tasks that finished strictly before this time
    pub finished_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn state(state: TaskState) -> Self {
        Self {
            states: vec![state],
            ..Default::default()
        }
    }

    /// Succeeded or Failed tasks that finished before `cutoff`
    pub fn terminal_before(cutoff: DateTime<Utc>) -> Self {
        Self {
            states: vec![TaskState::Succeeded, TaskState::Failed],
            kind: None,
            finished_before: Some(cutoff),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.states.is_empty() && !self.states.contains(&task.state) {
            return false;
        }
        if let Some(kind) = self.kind
            && task.kind != kind
        {
            return false;
        }
        if let Some(cutoff) = self.finished_before {
            match task.finished_at {
                Some(finished) if finished < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

/// Counts over the active tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub by_kind: BTreeMap<String, usize>,
}

impl QueueStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            stats.total += 1;
            match task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Retrying => stats.retrying += 1,
                TaskState::Succeeded => stats.succeeded += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Archived => {}
            }
            *stats.by_kind.entry(task.kind.to_string()).or_default() += 1;
        }
        stats
    }

    /// Tasks that still need work
    pub fn outstanding(&self) -> usize {
        self.pending + self.running + self.retrying
    }
}

/// Commands sent to the queue actor
#[derive(Debug)]
pub enum QueueCommand {
    Enqueue {
        definition: TaskDefinition,
        reply: oneshot::Sender<QueueResponse<String>>,
    },
    EnqueueBatch {
        definitions: Vec<TaskDefinition>,
        reply: oneshot::Sender<QueueResponse<Vec<QueueResponse<String>>>>,
    },
    DequeueNext {
        reply: oneshot::Sender<QueueResponse<Option<Task>>>,
    },
    PeekNext {
        reply: oneshot::Sender<QueueResponse<Option<Task>>>,
    },
    MarkResult {
        id: String,
        outcome: TaskOutcome,
        reply: oneshot::Sender<QueueResponse<Task>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<QueueResponse<Option<Task>>>,
    },
    List {
        filter: TaskFilter,
        reply: oneshot::Sender<QueueResponse<Vec<Task>>>,
    },
    Stats {
        reply: oneshot::Sender<QueueResponse<QueueStats>>,
    },
    RecoverRunning {
        reply: oneshot::Sender<QueueResponse<usize>>,
    },
    RequeueFailed {
        kind: Option<TaskKind>,
        reply: oneshot::Sender<QueueResponse<usize>>,
    },
    HasTaskKind {
        kind: TaskKind,
        subtype: Option<String>,
        reply: oneshot::Sender<QueueResponse<bool>>,
    },
    Archive {
        id: String,
        sink: Option<Arc<dyn ArchiveSink>>,
        reply: oneshot::Sender<QueueResponse<Task>>,
    },

    // Shutdown
    Shutdown,
}
