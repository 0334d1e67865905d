//! Task cleaner
//!
//! Moves finished tasks older than the retention window out of active
//! storage, into the archive sink or nowhere.

mod config;
mod sweeper;

pub use config::{CleanerConfig, RetentionMode, RetentionPolicy};
pub use sweeper::{CleanerError, SweepPreview, SweepReport, TaskCleaner};
