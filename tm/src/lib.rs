//! taskmill - task orchestration with credential rotation
//!
//! A long-running daemon that routes typed tasks to handlers, retries and
//! defers them, rotates a pool of rate-limited API credentials, archives
//! finished work, and paces itself by how the last cycle went.
//!
//! # Modules
//!
//! - [`registry`] - declarative module wiring resolved in dependency order
//! - [`queue`] - persistent priority queue of tasks (actor)
//! - [`dispatcher`] - runs ready tasks through their handlers
//! - [`rotation`] - credential pool with cooldown and exhaustion
//! - [`cleaner`] - retention sweeps into the archive
//! - [`supervisor`] - the adaptive improvement loop
//! - [`engine`] - assembles all of the above from [`config`]
//! - [`daemon`] - PID file, process control and the watchdog
//! - [`handlers`] - built-in shell and completion handlers

pub mod cleaner;
pub mod cli;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod handlers;
pub mod queue;
pub mod registry;
pub mod rotation;
pub mod store;
pub mod supervisor;

// Re-export commonly used types
pub use cleaner::{CleanerConfig, RetentionMode, RetentionPolicy, SweepPreview, SweepReport, TaskCleaner};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use daemon::{DaemonManager, RestartPolicy, Watchdog, WatchdogConfig};
pub use dispatcher::{
    CycleSummary, DispatcherConfig, FailureClass, HandlerContext, HandlerError, HandlerTable, TaskDispatcher,
    TaskHandler,
};
pub use domain::{Task, TaskDefinition, TaskKind, TaskState};
pub use engine::{AssemblyError, Engine, StoreSession};
pub use queue::{QueueConfig, QueueError, QueueStats, TaskFilter, TaskOutcome, TaskQueue};
pub use registry::{Constructors, Container, ModuleRegistry, ModuleSpec, RegistryError};
pub use rotation::{CallOutcome, CredentialState, Lease, ResourceRotationClient, RotationConfig, RotationError};
pub use supervisor::{CycleReport, Inbox, Supervisor, SupervisorConfig, SupervisorExit, SupervisorState};
