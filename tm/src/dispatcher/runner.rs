//! TaskDispatcher - one pass over the ready tasks

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Task, TaskState};
use crate::queue::{QueueError, TaskOutcome, TaskQueue};

use super::config::DispatcherConfig;
use super::handler::{FailureClass, HandlerContext, HandlerError, TaskHandler};
use super::summary::CycleSummary;
use super::table::HandlerTable;

/// Where a dispatched task ended up after its outcome was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Succeeded,
    Retried,
    Deferred,
    Failed,
}

/// Runs ready tasks through their handlers with bounded concurrency
#[derive(Debug, Clone)]
pub struct TaskDispatcher {
    queue: TaskQueue,
    handlers: Arc<HandlerTable>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl TaskDispatcher {
    pub fn new(queue: TaskQueue, handlers: Arc<HandlerTable>, config: DispatcherConfig) -> Self {
        debug!(?config, routes = handlers.len(), "TaskDispatcher::new: called");
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            queue,
            handlers,
            config,
            permits,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Dispatch until nothing is ready or `cancel` fires, then wait for the
    /// in-flight handlers
    ///
    /// Task failures never escape: every attempt ends in a recorded outcome
    /// or an `errors` count.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        debug!("TaskDispatcher::run_cycle: called");
        let mut summary = CycleSummary::default();
        let mut running: JoinSet<Result<Settled, QueueError>> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                debug!("TaskDispatcher::run_cycle: cancelled, no more dequeues");
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let task = match self.queue.dequeue_next().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!("TaskDispatcher::run_cycle: queue drained");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to dequeue task");
                    summary.errors += 1;
                    break;
                }
            };
            summary.dispatched += 1;

            let Some(handler) = self.handlers.lookup(task.kind, task.subtype.as_deref()) else {
                let reason = format!("unknown task type: {}", task.type_label());
                warn!(task_id = %task.id, %reason, "No handler bound");
                summary.unknown_type += 1;
                summary.failed += 1;
                if let Err(e) = self.queue.mark_result(&task.id, TaskOutcome::Fatal(reason)).await {
                    error!(task_id = %task.id, error = %e, "Failed to record outcome");
                    summary.errors += 1;
                }
                drop(permit);
                continue;
            };

            let queue = self.queue.clone();
            let child = cancel.child_token();
            let config = self.config.clone();
            running.spawn(async move {
                let settled = run_attempt(&queue, handler, task, child, &config).await;
                drop(permit);
                settled
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(Settled::Succeeded)) => summary.succeeded += 1,
                Ok(Ok(Settled::Retried)) => summary.retried += 1,
                Ok(Ok(Settled::Deferred)) => summary.deferred += 1,
                Ok(Ok(Settled::Failed)) => summary.failed += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to record outcome");
                    summary.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Dispatch task aborted");
                    summary.errors += 1;
                }
            }
        }

        if summary.is_idle() {
            debug!("TaskDispatcher::run_cycle: idle");
        } else {
            info!(%summary, "Dispatch cycle finished");
        }
        summary
    }
}

/// Run one handler invocation and record its outcome
async fn run_attempt(
    queue: &TaskQueue,
    handler: Arc<dyn TaskHandler>,
    task: Task,
    cancel: CancellationToken,
    config: &DispatcherConfig,
) -> Result<Settled, QueueError> {
    debug!(task_id = %task.id, attempt = task.attempt_count, "run_attempt: called");
    let timeout = config.handler_timeout();
    let ctx = HandlerContext::new(task.id.clone(), task.attempt_count, cancel.clone(), timeout);

    let invocation = AssertUnwindSafe(handler.execute(&ctx, &task.payload)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, invocation).await {
        Ok(Ok(Ok(result))) => TaskOutcome::Succeeded(result),
        Ok(Ok(Err(err))) => {
            debug!(task_id = %task.id, error = %err, "run_attempt: handler failed");
            to_outcome(handler.classify(&err), &err)
        }
        Ok(Err(panic)) => {
            let reason = format!("handler panicked: {}", panic_message(panic.as_ref()));
            error!(task_id = %task.id, %reason, "Handler panicked");
            TaskOutcome::Fatal(reason)
        }
        Err(_) => {
            cancel.cancel();
            let err = HandlerError::Timeout(format!("no result after {}ms", timeout.as_millis()));
            warn!(task_id = %task.id, "Handler timed out");
            to_outcome(handler.classify(&err), &err)
        }
    };

    let label = outcome.label();
    let deferred = matches!(outcome, TaskOutcome::Deferred { retry_after: Some(_), .. });
    let recorded = queue.mark_result(&task.id, outcome).await?;
    debug!(task_id = %task.id, outcome = label, state = %recorded.state, "run_attempt: recorded");

    Ok(match recorded.state {
        TaskState::Succeeded => Settled::Succeeded,
        TaskState::Retrying if deferred => Settled::Deferred,
        TaskState::Retrying => Settled::Retried,
        _ => Settled::Failed,
    })
}

fn to_outcome(class: FailureClass, err: &HandlerError) -> TaskOutcome {
    match class {
        FailureClass::Retryable => TaskOutcome::Retryable(err.to_string()),
        FailureClass::Fatal => TaskOutcome::Fatal(err.to_string()),
        FailureClass::Deferred(retry_after) => TaskOutcome::Deferred {
            reason: err.to_string(),
            retry_after,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
