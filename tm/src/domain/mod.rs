//! Domain types for taskmill
//!
//! Tasks are routed by a closed [`TaskKind`] plus an optional subtype.
//! Producers submit [`TaskDefinition`]s; the queue turns them into [`Task`]s.

mod id;
mod task;

pub use id::generate_task_id;
pub use task::{DefinitionError, RoutingKey, Task, TaskDefinition, TaskKind, TaskState};
