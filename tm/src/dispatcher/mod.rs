//! Task dispatcher
//!
//! Drains ready tasks from the queue, routes each to the handler bound to its
//! `(kind, subtype)`, and reports the classified outcome back.

mod config;
mod handler;
mod runner;
mod summary;
mod table;

pub use config::DispatcherConfig;
pub use handler::{FailureClass, HandlerContext, HandlerError, TaskHandler};
pub use runner::TaskDispatcher;
pub use summary::CycleSummary;
pub use table::HandlerTable;
