//! TaskQueue - actor that owns the task records
//!
//! Processes commands via channels; every mutation is persisted as a whole
//! snapshot before the reply is sent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::clock::{SharedClock, add_duration};
use crate::domain::{Task, TaskDefinition, TaskKind, TaskState};
use crate::store::{ArchiveSink, JsonFile, StoreError};

use super::config::QueueConfig;
use super::messages::{QueueCommand, QueueError, QueueResponse, QueueStats, TaskFilter, TaskOutcome};

/// On-disk form of the queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    next_seq: u64,
    tasks: Vec<Task>,
}

/// Read the queue snapshot without taking ownership of the store
///
/// Writers replace the file atomically, so this always sees a complete
/// snapshot, possibly a slightly stale one.
pub fn read_snapshot(path: &Path) -> Result<Vec<Task>, StoreError> {
    debug!(path = %path.display(), "read_snapshot: called");
    let file: JsonFile<QueueSnapshot> = JsonFile::new(path);
    let mut tasks = file.load()?.unwrap_or_default().tasks;
    tasks.sort_by_key(|t| t.seq);
    Ok(tasks)
}

fn store_err(e: StoreError) -> QueueError {
    QueueError::StoreError(e.to_string())
}

/// In-memory state owned by the actor
#[derive(Debug, Clone)]
struct QueueState {
    tasks: HashMap<String, Task>,
    next_seq: u64,
}

impl QueueState {
    fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        let next_seq = snapshot
            .tasks
            .iter()
            .map(|t| t.seq + 1)
            .max()
            .unwrap_or(0)
            .max(snapshot.next_seq);
        let tasks = snapshot.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self { tasks, next_seq }
    }

    fn to_snapshot(&self) -> QueueSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        QueueSnapshot {
            next_seq: self.next_seq,
            tasks,
        }
    }

    fn enqueue(&mut self, definition: TaskDefinition, now: DateTime<Utc>) -> QueueResponse<String> {
        let (kind, subtype, priority, payload) = definition.normalize()?;
        let task = Task::new(kind, subtype, priority, payload, now, self.next_seq);
        self.next_seq += 1;
        let id = task.id.clone();
        debug!(%id, kind = %task.kind, "QueueState::enqueue: task added");
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Retrying tasks whose delay has passed become Pending again
    fn promote_ready(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        for task in self.tasks.values_mut() {
            if task.state == TaskState::Retrying && task.ready_at.is_none_or(|at| at <= now) {
                task.set_state(TaskState::Pending, now);
                task.ready_at = None;
                promoted += 1;
            }
        }
        promoted
    }

    fn next_pending_id(&self) -> Option<String> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .min_by_key(|t| (t.priority, t.created_at, t.seq))
            .map(|t| t.id.clone())
    }

    fn dequeue_next(&mut self, now: DateTime<Utc>) -> Option<Task> {
        self.promote_ready(now);
        let id = self.next_pending_id()?;
        let task = self.tasks.get_mut(&id)?;
        task.set_state(TaskState::Running, now);
        task.attempt_count += 1;
        task.started_at = Some(now);
        Some(task.clone())
    }

    fn mark_result(
        &mut self,
        id: &str,
        outcome: TaskOutcome,
        config: &QueueConfig,
        now: DateTime<Utc>,
    ) -> QueueResponse<Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if task.state != TaskState::Running {
            return Err(QueueError::NotRunning {
                id: id.to_string(),
                state: task.state,
            });
        }

        match outcome {
            TaskOutcome::Succeeded(result) => {
                task.set_state(TaskState::Succeeded, now);
                task.result = Some(result);
                task.last_error = None;
                task.finished_at = Some(now);
            }
            TaskOutcome::Fatal(reason) => {
                task.set_state(TaskState::Failed, now);
                task.last_error = Some(reason);
                task.finished_at = Some(now);
            }
            // No known end to the shortage: spend the attempt like any retry
            TaskOutcome::Retryable(reason) | TaskOutcome::Deferred { reason, retry_after: None } => {
                task.last_error = Some(reason);
                if task.attempt_count < config.max_attempts {
                    let delay = config.retry_delay(task.attempt_count);
                    task.set_state(TaskState::Retrying, now);
                    task.ready_at = Some(add_duration(now, delay));
                    debug!(%id, attempt = task.attempt_count, ?delay, "QueueState::mark_result: retry scheduled");
                } else {
                    task.set_state(TaskState::Failed, now);
                    task.finished_at = Some(now);
                    debug!(%id, attempt = task.attempt_count, "QueueState::mark_result: retry budget exhausted");
                }
            }
            TaskOutcome::Deferred {
                reason,
                retry_after: Some(wait),
            } => {
                // The handler never reached its external call and a cooldown will end
                task.attempt_count = task.attempt_count.saturating_sub(1);
                task.last_error = Some(reason);
                task.set_state(TaskState::Retrying, now);
                task.ready_at = Some(add_duration(now, wait));
            }
        }
        Ok(task.clone())
    }

    fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    fn recover_running(&mut self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        for task in self.tasks.values_mut().filter(|t| t.state == TaskState::Running) {
            task.set_state(TaskState::Pending, now);
            task.last_error = Some("interrupted: process stopped while the task was running".to_string());
            recovered += 1;
        }
        recovered
    }

    fn requeue_failed(&mut self, kind: Option<TaskKind>, now: DateTime<Utc>) -> usize {
        let mut requeued = 0;
        for task in self
            .tasks
            .values_mut()
            .filter(|t| t.state == TaskState::Failed && kind.is_none_or(|k| t.kind == k))
        {
            task.set_state(TaskState::Pending, now);
            task.attempt_count = 0;
            task.last_error = None;
            task.finished_at = None;
            requeued += 1;
        }
        requeued
    }

    fn has_task_kind(&self, kind: TaskKind, subtype: Option<&str>) -> bool {
        self.tasks.values().any(|t| {
            t.kind == kind
                && !t.state.is_terminal()
                && subtype.is_none_or(|s| t.subtype.as_deref() == Some(s))
        })
    }

    fn archive(&mut self, id: &str, now: DateTime<Utc>) -> QueueResponse<Task> {
        let state = self
            .tasks
            .get(id)
            .map(|t| t.state)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !state.is_terminal() {
            return Err(QueueError::NotTerminal {
                id: id.to_string(),
                state,
            });
        }
        let mut task = self
            .tasks
            .remove(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        task.set_state(TaskState::Archived, now);
        Ok(task)
    }
}

/// Handle to send commands to the queue actor
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<QueueCommand>,
    store_path: PathBuf,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("store_path", &self.store_path).finish()
    }
}

impl TaskQueue {
    /// Load the snapshot at `store_path` and spawn the actor
    pub fn spawn(store_path: impl AsRef<Path>, config: QueueConfig, clock: SharedClock) -> QueueResponse<Self> {
        let store_path = store_path.as_ref().to_path_buf();
        debug!(store_path = %store_path.display(), ?config, "TaskQueue::spawn: called");

        let file: JsonFile<QueueSnapshot> = JsonFile::new(&store_path);
        let snapshot = file.load().map_err(store_err)?.unwrap_or_default();
        let state = QueueState::from_snapshot(snapshot);
        info!(tasks = state.tasks.len(), "Loaded task queue");

        let (tx, rx) = mpsc::channel(256);
        let actor = QueueActor {
            state,
            file,
            config,
            clock,
        };
        tokio::spawn(actor.run(rx));

        info!("TaskQueue spawned");
        Ok(Self { tx, store_path })
    }

    /// Path of the snapshot file
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<QueueResponse<T>>) -> QueueCommand) -> QueueResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| QueueError::ChannelError)?;
        reply_rx.await.map_err(|_| QueueError::ChannelError)?
    }

    /// Validate and add a task in Pending
    pub async fn enqueue(&self, definition: TaskDefinition) -> QueueResponse<String> {
        debug!(task_type = ?definition.task_type, "enqueue: called");
        self.request(|reply| QueueCommand::Enqueue { definition, reply }).await
    }

    /// Enqueue several definitions; each gets its own result
    pub async fn enqueue_batch(&self, definitions: Vec<TaskDefinition>) -> QueueResponse<Vec<QueueResponse<String>>> {
        debug!(count = definitions.len(), "enqueue_batch: called");
        self.request(|reply| QueueCommand::EnqueueBatch { definitions, reply })
            .await
    }

    /// Take the next ready task and mark it Running
    ///
    /// Returns `None` when nothing is ready; never waits for work.
    pub async fn dequeue_next(&self) -> QueueResponse<Option<Task>> {
        debug!("dequeue_next: called");
        self.request(|reply| QueueCommand::DequeueNext { reply }).await
    }

    /// The task `dequeue_next` would return, left untouched
    pub async fn peek_next(&self) -> QueueResponse<Option<Task>> {
        debug!("peek_next: called");
        self.request(|reply| QueueCommand::PeekNext { reply }).await
    }

    /// Record the outcome of a Running task's attempt
    pub async fn mark_result(&self, id: &str, outcome: TaskOutcome) -> QueueResponse<Task> {
        debug!(%id, outcome = outcome.label(), "mark_result: called");
        let id = id.to_string();
        self.request(|reply| QueueCommand::MarkResult { id, outcome, reply })
            .await
    }

    pub async fn get(&self, id: &str) -> QueueResponse<Option<Task>> {
        debug!(%id, "get: called");
        let id = id.to_string();
        self.request(|reply| QueueCommand::Get { id, reply }).await
    }

    pub async fn list(&self, filter: TaskFilter) -> QueueResponse<Vec<Task>> {
        debug!(?filter, "list: called");
        self.request(|reply| QueueCommand::List { filter, reply }).await
    }

    pub async fn stats(&self) -> QueueResponse<QueueStats> {
        debug!("stats: called");
        self.request(|reply| QueueCommand::Stats { reply }).await
    }

    /// Return tasks left Running by a previous process to Pending
    pub async fn recover_running(&self) -> QueueResponse<usize> {
        debug!("recover_running: called");
        self.request(|reply| QueueCommand::RecoverRunning { reply }).await
    }

    /// Give Failed tasks a fresh retry budget
    pub async fn requeue_failed(&self, kind: Option<TaskKind>) -> QueueResponse<usize> {
        debug!(?kind, "requeue_failed: called");
        self.request(|reply| QueueCommand::RequeueFailed { kind, reply }).await
    }

    /// Whether unfinished work of this kind (and subtype, if given) exists
    pub async fn has_task_kind(&self, kind: TaskKind, subtype: Option<&str>) -> QueueResponse<bool> {
        debug!(%kind, ?subtype, "has_task_kind: called");
        let subtype = subtype.map(str::to_string);
        self.request(|reply| QueueCommand::HasTaskKind { kind, subtype, reply })
            .await
    }

    /// Remove a terminal task from active storage
    ///
    /// Fails with `NotTerminal` for anything still pending, running or retrying.
    pub async fn archive(&self, id: &str) -> QueueResponse<Task> {
        debug!(%id, "archive: called");
        let id = id.to_string();
        self.request(|reply| QueueCommand::Archive { id, sink: None, reply })
            .await
    }

    /// Remove a terminal task and record it in `sink` as one step
    ///
    /// The state check, the removal and the sink write happen inside the
    /// actor, so a task that changed since it was listed is never written to
    /// the sink. The removal is persisted before the sink write, so a record
    /// is written at most once. A sink failure puts the task back.
    pub async fn archive_into(&self, id: &str, sink: Arc<dyn ArchiveSink>) -> QueueResponse<Task> {
        debug!(%id, "archive_into: called");
        let id = id.to_string();
        self.request(|reply| QueueCommand::Archive {
            id,
            sink: Some(sink),
            reply,
        })
        .await
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> QueueResponse<()> {
        debug!("shutdown: called");
        self.tx
            .send(QueueCommand::Shutdown)
            .await
            .map_err(|_| QueueError::ChannelError)
    }
}

struct QueueActor {
    state: QueueState,
    file: JsonFile<QueueSnapshot>,
    config: QueueConfig,
    clock: SharedClock,
}

impl QueueActor {
    /// Apply a mutation and persist it, restoring the prior state if the
    /// mutation or the write fails
    fn mutate<T>(&mut self, op: impl FnOnce(&mut QueueState, DateTime<Utc>) -> QueueResponse<T>) -> QueueResponse<T> {
        let before = self.state.clone();
        let now = self.clock.now();
        let result = match op(&mut self.state, now) {
            Ok(result) => result,
            Err(e) => {
                self.state = before;
                return Err(e);
            }
        };
        if let Err(e) = self.file.save(&self.state.to_snapshot()) {
            warn!(error = %e, "Failed to persist task queue, rolling back");
            self.state = before;
            return Err(store_err(e));
        }
        Ok(result)
    }

    /// Remove and persist first, then write the sink; a sink failure puts
    /// the task back
    fn archive_into(&mut self, id: &str, sink: &dyn ArchiveSink) -> QueueResponse<Task> {
        let before = self.state.clone();
        let task = self.mutate(|state, now| state.archive(id, now))?;
        if let Err(e) = sink.store(&task) {
            warn!(%id, error = %e, "Failed to write archive record, restoring task");
            self.state = before;
            if let Err(save) = self.file.save(&self.state.to_snapshot()) {
                error!(%id, error = %save, "Failed to persist restored task");
            }
            return Err(store_err(e));
        }
        Ok(task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<QueueCommand>) {
        debug!("TaskQueue actor started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                QueueCommand::Enqueue { definition, reply } => {
                    debug!("actor_loop: Enqueue command");
                    let result = self.mutate(|state, now| state.enqueue(definition, now));
                    let _ = reply.send(result);
                }

                QueueCommand::EnqueueBatch { definitions, reply } => {
                    debug!(count = definitions.len(), "actor_loop: EnqueueBatch command");
                    let result = self.mutate(|state, now| {
                        Ok(definitions
                            .into_iter()
                            .map(|definition| state.enqueue(definition, now))
                            .collect::<Vec<_>>())
                    });
                    let _ = reply.send(result);
                }

                QueueCommand::DequeueNext { reply } => {
                    debug!("actor_loop: DequeueNext command");
                    let result = self.mutate(|state, now| Ok(state.dequeue_next(now)));
                    let _ = reply.send(result);
                }

                QueueCommand::PeekNext { reply } => {
                    debug!("actor_loop: PeekNext command");
                    let now = self.clock.now();
                    let mut preview = self.state.clone();
                    preview.promote_ready(now);
                    let result = preview.next_pending_id().and_then(|id| preview.tasks.remove(&id));
                    let _ = reply.send(Ok(result));
                }

                QueueCommand::MarkResult { id, outcome, reply } => {
                    debug!(%id, "actor_loop: MarkResult command");
                    let config = self.config.clone();
                    let result = self.mutate(|state, now| state.mark_result(&id, outcome, &config, now));
                    let _ = reply.send(result);
                }

                QueueCommand::Get { id, reply } => {
                    debug!(%id, "actor_loop: Get command");
                    let _ = reply.send(Ok(self.state.tasks.get(&id).cloned()));
                }

                QueueCommand::List { filter, reply } => {
                    debug!(?filter, "actor_loop: List command");
                    let _ = reply.send(Ok(self.state.list(&filter)));
                }

                QueueCommand::Stats { reply } => {
                    debug!("actor_loop: Stats command");
                    let _ = reply.send(Ok(QueueStats::from_tasks(self.state.tasks.values())));
                }

                QueueCommand::RecoverRunning { reply } => {
                    debug!("actor_loop: RecoverRunning command");
                    let result = self.mutate(|state, now| Ok(state.recover_running(now)));
                    if let Ok(count) = &result
                        && *count > 0
                    {
                        info!(count, "Recovered interrupted tasks");
                    }
                    let _ = reply.send(result);
                }

                QueueCommand::RequeueFailed { kind, reply } => {
                    debug!(?kind, "actor_loop: RequeueFailed command");
                    let result = self.mutate(|state, now| Ok(state.requeue_failed(kind, now)));
                    let _ = reply.send(result);
                }

                QueueCommand::HasTaskKind { kind, subtype, reply } => {
                    debug!(%kind, ?subtype, "actor_loop: HasTaskKind command");
                    let _ = reply.send(Ok(self.state.has_task_kind(kind, subtype.as_deref())));
                }

                QueueCommand::Archive { id, sink, reply } => {
                    debug!(%id, "actor_loop: Archive command");
                    let result = match sink {
                        Some(sink) => self.archive_into(&id, sink.as_ref()),
                        None => self.mutate(|state, now| state.archive(&id, now)),
                    };
                    let _ = reply.send(result);
                }

                QueueCommand::Shutdown => {
                    debug!("actor_loop: Shutdown command");
                    info!("TaskQueue shutting down");
                    break;
                }
            }
        }

        debug!("TaskQueue actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::JsonlArchive;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn spawn_queue(dir: &Path, config: QueueConfig) -> (TaskQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueue::spawn(dir.join("task_queue.json"), config, clock.clone()).unwrap();
        (queue, clock)
    }

    fn def(kind: &str) -> TaskDefinition {
        TaskDefinition::new(kind, json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_type() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());

        let err = queue.enqueue(def("launch_rocket")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask(_)));
        assert_eq!(queue.stats().await.unwrap().total, 0);

        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_marks_running() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());

        let first = queue.enqueue(def("analysis")).await.unwrap();
        let second = queue.enqueue(def("test")).await.unwrap();

        let task = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(task.id, first);
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.attempt_count, 1);

        let task = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(task.id, second);

        assert!(queue.dequeue_next().await.unwrap().is_none());
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_beats_arrival_order() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());

        queue.enqueue(def("analysis")).await.unwrap();
        let urgent = queue.enqueue(def("code_fix").with_priority(-1)).await.unwrap();

        assert_eq!(queue.peek_next().await.unwrap().unwrap().id, urgent);
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, urgent);
    }

    #[tokio::test]
    async fn test_mark_result_requires_running() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());

        let id = queue.enqueue(def("analysis")).await.unwrap();
        let err = queue.mark_result(&id, TaskOutcome::Succeeded(json!(null))).await.unwrap_err();
        assert!(matches!(err, QueueError::NotRunning { state: TaskState::Pending, .. }));

        let err = queue.mark_result("nope", TaskOutcome::Fatal("x".into())).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_then_fail_after_budget() {
        let temp = tempdir().unwrap();
        let config = QueueConfig {
            max_attempts: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
        };
        let (queue, clock) = spawn_queue(temp.path(), config);
        let id = queue.enqueue(def("analysis")).await.unwrap();

        for attempt in 1..=3 {
            let task = queue.dequeue_next().await.unwrap().unwrap();
            assert_eq!(task.attempt_count, attempt);
            let after = queue.mark_result(&id, TaskOutcome::Retryable("timeout".into())).await.unwrap();
            if attempt < 3 {
                assert_eq!(after.state, TaskState::Retrying);
                // Not eligible until the backoff passes
                assert!(queue.dequeue_next().await.unwrap().is_none());
                clock.advance(Duration::from_millis(1_000 << (attempt - 1)));
            } else {
                assert_eq!(after.state, TaskState::Failed);
                assert_eq!(after.last_error.as_deref(), Some("timeout"));
            }
        }
        assert!(queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deferred_does_not_spend_attempts() {
        let temp = tempdir().unwrap();
        let (queue, clock) = spawn_queue(temp.path(), QueueConfig::default());
        let id = queue.enqueue(def("documentation")).await.unwrap();

        queue.dequeue_next().await.unwrap().unwrap();
        let task = queue
            .mark_result(
                &id,
                TaskOutcome::Deferred {
                    reason: "no credential".into(),
                    retry_after: Some(Duration::from_secs(5)),
                },
            )
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Retrying);
        assert_eq!(task.attempt_count, 0);

        clock.advance(Duration::from_secs(5));
        let task = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_open_ended_deferral_spends_attempts() {
        let temp = tempdir().unwrap();
        let config = QueueConfig {
            max_attempts: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
        };
        let (queue, clock) = spawn_queue(temp.path(), config);
        let id = queue.enqueue(def("documentation")).await.unwrap();

        for attempt in 1..=3 {
            let task = queue.dequeue_next().await.unwrap().unwrap();
            assert_eq!(task.attempt_count, attempt);
            let after = queue
                .mark_result(
                    &id,
                    TaskOutcome::Deferred {
                        reason: "all credentials exhausted".into(),
                        retry_after: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(after.attempt_count, attempt);
            if attempt < 3 {
                assert_eq!(after.state, TaskState::Retrying);
                assert!(queue.dequeue_next().await.unwrap().is_none());
                clock.advance(Duration::from_millis(1_000 << (attempt - 1)));
            } else {
                assert_eq!(after.state, TaskState::Failed);
                assert!(after.finished_at.is_some());
            }
        }
        assert!(queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_restart_and_recovers_running() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let running = queue.enqueue(def("analysis")).await.unwrap();
        let waiting = queue.enqueue(def("test")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue.shutdown().await.unwrap();

        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let task = queue.get(&running).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Running);

        assert_eq!(queue.recover_running().await.unwrap(), 1);
        let task = queue.get(&running).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.last_error.is_some());

        // Original order survives the restart
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, running);
        assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, waiting);

        // New tasks continue the sequence
        let later = queue.enqueue(def("analysis")).await.unwrap();
        let tasks = read_snapshot(&temp.path().join("task_queue.json")).unwrap();
        assert_eq!(tasks.last().map(|t| t.id.as_str()), Some(later.as_str()));
    }

    #[tokio::test]
    async fn test_archive_only_terminal() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let done = queue.enqueue(def("analysis")).await.unwrap();
        let pending = queue.enqueue(def("analysis")).await.unwrap();

        queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_result(&done, TaskOutcome::Succeeded(json!("ok"))).await.unwrap();

        let err = queue.archive(&pending).await.unwrap_err();
        assert!(matches!(err, QueueError::NotTerminal { .. }));

        let archived = queue.archive(&done).await.unwrap();
        assert_eq!(archived.state, TaskState::Archived);
        assert!(queue.get(&done).await.unwrap().is_none());
    }

    #[derive(Debug)]
    struct RefusingSink;

    impl ArchiveSink for RefusingSink {
        fn store(&self, _task: &Task) -> Result<(), StoreError> {
            Err(StoreError::io(Path::new("archive.jsonl"), std::io::Error::other("read-only")))
        }
    }

    #[tokio::test]
    async fn test_archive_into_keeps_task_when_sink_fails() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let id = queue.enqueue(def("analysis")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_result(&id, TaskOutcome::Succeeded(json!(1))).await.unwrap();

        let err = queue.archive_into(&id, Arc::new(RefusingSink)).await.unwrap_err();
        assert!(matches!(err, QueueError::StoreError(_)));
        assert_eq!(queue.get(&id).await.unwrap().unwrap().state, TaskState::Succeeded);

        let tasks = read_snapshot(&temp.path().join("task_queue.json")).unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_into_writes_nothing_when_removal_not_persisted() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let id = queue.enqueue(def("analysis")).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_result(&id, TaskOutcome::Succeeded(json!(1))).await.unwrap();

        // A directory in place of the snapshot makes the next save fail
        let store = temp.path().join("task_queue.json");
        std::fs::remove_file(&store).unwrap();
        std::fs::create_dir(&store).unwrap();

        let archive = Arc::new(JsonlArchive::new(temp.path().join("archive.jsonl")));
        let err = queue.archive_into(&id, archive.clone()).await.unwrap_err();
        assert!(matches!(err, QueueError::StoreError(_)));
        assert!(archive.read_all().unwrap().is_empty());
        assert_eq!(queue.get(&id).await.unwrap().unwrap().state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_requeue_failed_by_kind() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let a = queue.enqueue(def("analysis")).await.unwrap();
        let t = queue.enqueue(def("test")).await.unwrap();
        for id in [&a, &t] {
            queue.dequeue_next().await.unwrap().unwrap();
            queue.mark_result(id, TaskOutcome::Fatal("boom".into())).await.unwrap();
        }

        assert_eq!(queue.requeue_failed(Some(TaskKind::Test)).await.unwrap(), 1);
        let task = queue.get(&t).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(queue.get(&a).await.unwrap().unwrap().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_has_task_kind_ignores_finished() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        let id = queue
            .enqueue(def("self_improvement").with_subtype("performance"))
            .await
            .unwrap();

        assert!(queue.has_task_kind(TaskKind::SelfImprovement, None).await.unwrap());
        assert!(queue.has_task_kind(TaskKind::SelfImprovement, Some("performance")).await.unwrap());
        assert!(!queue.has_task_kind(TaskKind::SelfImprovement, Some("security")).await.unwrap());

        queue.dequeue_next().await.unwrap().unwrap();
        queue.mark_result(&id, TaskOutcome::Succeeded(json!(null))).await.unwrap();
        assert!(!queue.has_task_kind(TaskKind::SelfImprovement, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_batch_reports_each() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());

        let results = queue
            .enqueue_batch(vec![def("analysis"), def("bogus"), def("test")])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(QueueError::InvalidTask(_))));
        assert!(results[2].is_ok());
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_never_double_dispatches() {
        let temp = tempdir().unwrap();
        let (queue, _) = spawn_queue(temp.path(), QueueConfig::default());
        for _ in 0..20 {
            queue.enqueue(def("analysis")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(task) = queue.dequeue_next().await.unwrap() {
                    seen.push(task.id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }
}
