//! Engine - the assembled runtime
//!
//! Opens the store, spawns the queue, resolves the module wiring and builds
//! the dispatcher, cleaner, inbox and supervisor on top. One value holds all
//! of it and is passed by reference; there are no process-wide singletons.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cleaner::{RetentionPolicy, TaskCleaner};
use crate::clock::{SharedClock, system_clock};
use crate::config::Config;
use crate::dispatcher::{HandlerTable, TaskDispatcher};
use crate::handlers::builtin_constructors;
use crate::queue::{QueueError, TaskQueue};
use crate::registry::{Constructors, Container, ModuleRegistry, RegistryError};
use crate::rotation::ResourceRotationClient;
use crate::store::{JsonlArchive, StoreError, StoreLayout, StoreLock};
use crate::supervisor::{Inbox, Supervisor};

/// Startup failures; the daemon exits with the assembly code and the
/// watchdog does not restart it
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to open task queue: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Locked store plus a running queue
///
/// Enough for maintenance commands (sweep, requeue) that do not dispatch.
#[derive(Debug)]
pub struct StoreSession {
    layout: StoreLayout,
    _lock: StoreLock,
    queue: TaskQueue,
    clock: SharedClock,
    recovered: usize,
}

impl StoreSession {
    /// Take the store lock, load the queue and put stuck tasks back to Pending
    pub async fn open(config: &Config, clock: SharedClock) -> Result<Self, AssemblyError> {
        let layout = StoreLayout::new(&config.storage.store_dir);
        debug!(store = %layout.root().display(), "StoreSession::open: called");
        let lock = StoreLock::acquire(layout.root())?;
        let queue = TaskQueue::spawn(layout.queue_file(), config.queue.clone(), clock.clone())?;

        let recovered = queue.recover_running().await?;
        if recovered > 0 {
            warn!(recovered, "Recovered tasks left Running by a previous process");
        }

        Ok(Self {
            layout,
            _lock: lock,
            queue,
            clock,
            recovered,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Tasks moved from Running back to Pending at open
    pub fn recovered(&self) -> usize {
        self.recovered
    }

    /// Cleaner writing to the store's archive and backup directory
    pub fn cleaner(&self) -> TaskCleaner {
        TaskCleaner::new(
            self.queue.clone(),
            Arc::new(JsonlArchive::new(self.layout.archive_file())),
            self.layout.backup_dir(),
            self.clock.clone(),
        )
    }

    pub fn inbox(&self) -> Inbox {
        Inbox::new(self.layout.inbox_dir())
    }

    /// Flush and stop the queue actor
    pub async fn shutdown(&self) {
        debug!("StoreSession::shutdown: called");
        if let Err(e) = self.queue.shutdown().await {
            warn!(error = %e, "Queue shutdown failed");
        }
    }
}

/// Fully assembled runtime
pub struct Engine {
    config: Config,
    store: StoreSession,
    container: Container,
    dispatcher: TaskDispatcher,
    cleaner: Arc<TaskCleaner>,
    rotation: Option<Arc<ResourceRotationClient>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("modules", &self.container.attrs())
            .finish()
    }
}

impl Engine {
    /// Assemble with the built-in module constructors and the system clock
    pub async fn open(config: Config) -> Result<Self, AssemblyError> {
        let constructors = builtin_constructors(&config);
        Self::assemble(config, &constructors, system_clock()).await
    }

    /// Assemble with explicit constructors and clock
    ///
    /// The clock is published to the modules under the attr `clock`.
    pub async fn assemble(
        config: Config,
        constructors: &Constructors,
        clock: SharedClock,
    ) -> Result<Self, AssemblyError> {
        debug!(modules = config.modules.len(), "Engine::assemble: called");
        config.validate().map_err(|e| AssemblyError::Config(e.to_string()))?;

        let store = StoreSession::open(&config, clock.clone()).await?;

        let mut registry = ModuleRegistry::from_specs(config.modules.clone())?;
        registry.provide("clock", clock.clone());
        let container = match registry.resolve(constructors) {
            Ok(container) => container,
            Err(e) => {
                store.shutdown().await;
                return Err(e.into());
            }
        };

        let handlers = HandlerTable::from_container(&config.modules, &container)?;
        info!(bindings = handlers.len(), "Handler table built");

        let rotation = config
            .modules
            .iter()
            .find(|spec| spec.constructor_name() == "rotation")
            .and_then(|spec| container.get::<Arc<ResourceRotationClient>>(&spec.attr).ok());

        let dispatcher = TaskDispatcher::new(store.queue().clone(), Arc::new(handlers), config.dispatcher.clone());
        let cleaner = Arc::new(store.cleaner());

        info!(
            store = %store.layout().root().display(),
            modules = container.len(),
            rotation = rotation.is_some(),
            "Engine assembled"
        );
        Ok(Self {
            config,
            store,
            container,
            dispatcher,
            cleaner,
            rotation,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StoreSession {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        self.store.queue()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn cleaner(&self) -> &Arc<TaskCleaner> {
        &self.cleaner
    }

    /// The credential pool, when the wiring includes a rotation module
    pub fn rotation(&self) -> Option<&Arc<ResourceRotationClient>> {
        self.rotation.as_ref()
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.config.cleaner.policy()
    }

    /// A fresh supervisor over this engine's components
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            self.dispatcher.clone(),
            self.cleaner.clone(),
            self.store.inbox(),
            &self.config.supervisor,
            &self.config.cleaner,
        )
    }

    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.store.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::TaskKind;
    use crate::registry::ModuleSpec;
    use tempfile::tempdir;

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.store_dir = root.to_path_buf();
        config.modules = vec![ModuleSpec::new("command", "runner").handles(TaskKind::Test, None)];
        config
    }

    #[tokio::test]
    async fn test_assemble_without_rotation() {
        let temp = tempdir().unwrap();
        let config = config(temp.path());
        let constructors = builtin_constructors(&config);

        let engine = Engine::assemble(config, &constructors, Arc::new(ManualClock::default()))
            .await
            .unwrap();
        assert!(engine.rotation().is_none());
        assert!(engine.container().contains("runner"));
        assert!(engine.container().contains("clock"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_session_is_locked_out() {
        let temp = tempdir().unwrap();
        let config = config(temp.path());
        let clock: SharedClock = Arc::new(ManualClock::default());

        let first = StoreSession::open(&config, clock.clone()).await.unwrap();
        let err = StoreSession::open(&config, clock).await.unwrap_err();
        assert!(matches!(err, AssemblyError::Store(StoreError::Locked(_))));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_constructor_is_assembly_error() {
        let temp = tempdir().unwrap();
        let mut config = config(temp.path());
        config.modules = vec![ModuleSpec::new("nowhere", "x")];

        let err = Engine::assemble(config, &Constructors::new(), Arc::new(ManualClock::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Registry(RegistryError::MissingConstructor(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_assembly_error() {
        let temp = tempdir().unwrap();
        let mut config = config(temp.path());
        config.queue.max_attempts = 0;

        let err = Engine::assemble(config, &Constructors::new(), Arc::new(ManualClock::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Config(_)));
    }
}
