//! Task queue with the actor pattern
//!
//! The queue actor owns every task record and the store file. Callers hold a
//! cloneable [`TaskQueue`] handle; commands are processed one at a time, so
//! transitions on the same task never interleave.

mod config;
mod manager;
mod messages;

pub use config::QueueConfig;
pub use manager::{TaskQueue, read_snapshot};
pub use messages::{QueueCommand, QueueError, QueueResponse, QueueStats, TaskFilter, TaskOutcome};
