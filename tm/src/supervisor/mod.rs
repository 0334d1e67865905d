//! Continuous improvement supervisor
//!
//! The long-running loop: ingest new task files, run a dispatch cycle, sweep
//! now and then, and pause for an interval that adapts to how the last cycle
//! went.

mod config;
mod inbox;
mod pacing;
mod runner;

pub use config::SupervisorConfig;
pub use inbox::{Inbox, IngestReport, load_definitions};
pub use pacing::{PacingPolicy, SupervisorRunRecord};
pub use runner::{CycleReport, Supervisor, SupervisorExit, SupervisorState};
