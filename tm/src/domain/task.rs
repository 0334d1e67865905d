//! Task records and their input definitions

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::generate_task_id;

/// Known task kinds
///
/// The set is closed: a definition naming anything else is rejected at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CodeGeneration,
    Refactoring,
    Analysis,
    Test,
    Documentation,
    SelfImprovement,
    #[serde(alias = "runtime_error_fix")]
    CodeFix,
    ArchitectureImprovement,
}

impl TaskKind {
    pub const ALL: [TaskKind; 8] = [
        TaskKind::CodeGeneration,
        TaskKind::Refactoring,
        TaskKind::Analysis,
        TaskKind::Test,
        TaskKind::Documentation,
        TaskKind::SelfImprovement,
        TaskKind::CodeFix,
        TaskKind::ArchitectureImprovement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CodeGeneration => "code_generation",
            TaskKind::Refactoring => "refactoring",
            TaskKind::Analysis => "analysis",
            TaskKind::Test => "test",
            TaskKind::Documentation => "documentation",
            TaskKind::SelfImprovement => "self_improvement",
            TaskKind::CodeFix => "code_fix",
            TaskKind::ArchitectureImprovement => "architecture_improvement",
        }
    }

    /// Older task files carry the subtype under a per-kind field name
    pub fn legacy_subtype_field(&self) -> Option<&'static str> {
        match self {
            TaskKind::Refactoring => Some("refactoring_type"),
            TaskKind::Analysis => Some("analysis_type"),
            TaskKind::Test => Some("test_type"),
            TaskKind::Documentation => Some("doc_type"),
            TaskKind::SelfImprovement | TaskKind::ArchitectureImprovement => Some("improvement_type"),
            TaskKind::CodeFix => Some("error_type"),
            TaskKind::CodeGeneration => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "runtime_error_fix" => Ok(TaskKind::CodeFix),
            other => TaskKind::ALL
                .into_iter()
                .find(|k| k.as_str() == other)
                .ok_or_else(|| DefinitionError::UnknownType(s.to_string())),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Archived,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Retrying,
        TaskState::Archived,
    ];

    /// Succeeded or Failed; eligible for archival
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        TaskState::ALL
            .into_iter()
            .find(|st| st.as_str() == lower)
            .ok_or_else(|| format!("Unknown task state: {}", s))
    }
}

/// Handler lookup key
pub type RoutingKey = (TaskKind, Option<String>);

/// A unit of routed work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: Value,
    pub state: TaskState,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal creation timestamps
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a Retrying task may run again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a Pending task
    pub fn new(
        kind: TaskKind,
        subtype: Option<String>,
        priority: i32,
        payload: Value,
        now: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        debug!(%kind, ?subtype, priority, seq, "Task::new: called");
        Self {
            id: generate_task_id(kind),
            kind,
            subtype,
            priority,
            payload,
            state: TaskState::Pending,
            attempt_count: 0,
            last_error: None,
            result: None,
            created_at: now,
            seq,
            updated_at: now,
            started_at: None,
            finished_at: None,
            ready_at: None,
        }
    }

    pub fn routing_key(&self) -> RoutingKey {
        (self.kind, self.subtype.clone())
    }

    /// Human-readable type label, `kind/subtype` when a subtype is set
    pub fn type_label(&self) -> String {
        match &self.subtype {
            Some(sub) => format!("{}/{}", self.kind, sub),
            None => self.kind.to_string(),
        }
    }

    pub(crate) fn set_state(&mut self, state: TaskState, now: DateTime<Utc>) {
        debug!(id = %self.id, from = %self.state, to = %state, "Task::set_state: called");
        self.state = state;
        self.updated_at = now;
    }
}

/// Errors from validating a task definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Task definition is missing 'type'")]
    MissingType,

    #[error("Unknown task type: {0}")]
    UnknownType(String),
}

/// Task as submitted by a producer
///
/// Only `type` is required. Fields other than the known ones are gathered
/// into the payload unless an explicit `payload` is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDefinition {
    /// Definition with a type and payload
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: Some(task_type.into()),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Validate and split into kind, subtype, priority and payload
    pub fn normalize(self) -> Result<(TaskKind, Option<String>, i32, Value), DefinitionError> {
        debug!(task_type = ?self.task_type, subtype = ?self.subtype, "TaskDefinition::normalize: called");
        let raw = self.task_type.ok_or(DefinitionError::MissingType)?;
        let kind: TaskKind = raw.parse()?;

        let mut extra = self.extra;
        let legacy = kind
            .legacy_subtype_field()
            .and_then(|field| extra.remove(field))
            .and_then(|v| v.as_str().map(str::to_string));
        let subtype = self.subtype.or(legacy).filter(|s| !s.trim().is_empty());

        let payload = match self.payload {
            Some(payload) => payload,
            None => Value::Object(extra),
        };

        Ok((kind, subtype, self.priority, payload))
    }
}
