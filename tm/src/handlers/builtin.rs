//! Constructors for the built-in modules and their default wiring

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::clock::{SharedClock, system_clock};
use crate::config::Config;
use crate::dispatcher::TaskHandler;
use crate::domain::TaskKind;
use crate::registry::{Constructors, Dependencies, ModuleSpec};
use crate::rotation::ResourceRotationClient;
use crate::store::StoreLayout;

use super::command::CommandHandler;
use super::completion::{CompletionBackend, CompletionHandler};
use super::gemini::GeminiBackend;

/// Task kinds served by the completion handler out of the box
const GENERATIVE_KINDS: [TaskKind; 7] = [
    TaskKind::CodeGeneration,
    TaskKind::Refactoring,
    TaskKind::Analysis,
    TaskKind::Documentation,
    TaskKind::SelfImprovement,
    TaskKind::CodeFix,
    TaskKind::ArchitectureImprovement,
];

/// Wiring used when the configuration has no `modules:` list
pub fn default_wiring() -> Vec<ModuleSpec> {
    let completion = GENERATIVE_KINDS.iter().fold(
        ModuleSpec::new("completion", "completion_handler")
            .dep("backend", "llm")
            .dep("rotation", "rotation"),
        |spec, kind| spec.handles(*kind, None),
    );

    vec![
        ModuleSpec::new("rotation", "rotation").dep("clock", "clock"),
        ModuleSpec::new("gemini", "llm"),
        completion,
        ModuleSpec::new("command", "test_runner").handles(TaskKind::Test, None),
    ]
}

/// Factories for `rotation`, `gemini`, `completion` and `command`
///
/// `rotation` reads its keys from the environment variable named in
/// `rotation.api-key-env` and keeps cooldown state in the store directory.
pub fn builtin_constructors(config: &Config) -> Constructors {
    debug!("builtin_constructors: called");
    let mut constructors = Constructors::new();

    let rotation_config = config.rotation.clone();
    let credentials_file = StoreLayout::new(&config.storage.store_dir).credentials_file();
    constructors.register("rotation", move |deps: &Dependencies<'_>| {
        let clock: SharedClock = deps.optional("clock")?.unwrap_or_else(system_clock);
        let client = ResourceRotationClient::from_env(rotation_config.clone(), clock)?
            .with_persistence(&credentials_file)?;
        Ok(Arc::new(client))
    });

    let backend_config = config.rotation.clone();
    constructors.register("gemini", move |_deps: &Dependencies<'_>| {
        let backend: Arc<dyn CompletionBackend> = Arc::new(GeminiBackend::new(&backend_config)?);
        Ok(backend)
    });

    constructors.register("completion", |deps: &Dependencies<'_>| {
        let backend: Arc<dyn CompletionBackend> = deps.get("backend")?;
        let rotation: Arc<ResourceRotationClient> = deps.get("rotation")?;
        let cache_size = match deps.options().get("cache-size") {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| eyre::eyre!("options.cache-size must be a non-negative integer"))?,
            None => 0,
        };
        let handler: Arc<dyn TaskHandler> =
            Arc::new(CompletionHandler::new(backend, rotation).with_cache(cache_size as usize));
        Ok(handler)
    });

    constructors.register("command", |deps: &Dependencies<'_>| {
        let workdir = match deps.options().get("workdir") {
            Some(value) => Some(PathBuf::from(
                value
                    .as_str()
                    .ok_or_else(|| eyre::eyre!("options.workdir must be a string"))?,
            )),
            None => None,
        };
        if let Some(dir) = &workdir
            && !dir.is_dir()
        {
            return Err(eyre::eyre!("options.workdir is not a directory: {}", dir.display()));
        }
        let handler: Arc<dyn TaskHandler> = Arc::new(CommandHandler::new(workdir));
        Ok(handler)
    });

    constructors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::HandlerTable;
    use crate::registry::{ModuleRegistry, RegistryError, topological_order};
    use tempfile::tempdir;

    #[test]
    fn test_default_wiring_is_acyclic_and_covers_every_kind() {
        let wiring = default_wiring();
        let order = topological_order(&wiring).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| wiring[i].name.as_str()).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("rotation") < pos("completion"));
        assert!(pos("gemini") < pos("completion"));

        for kind in TaskKind::ALL {
            assert!(
                wiring.iter().any(|s| s.handles.iter().any(|h| h.task_type == kind)),
                "{} has no handler",
                kind
            );
        }
    }

    #[test]
    fn test_missing_keys_fail_assembly() {
        let temp = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.store_dir = temp.path().to_path_buf();
        config.rotation.api_key_env = "TASKMILL_TEST_KEYS_THAT_ARE_NEVER_SET".to_string();

        let mut registry = ModuleRegistry::from_specs(default_wiring()).unwrap();
        registry.provide("clock", system_clock());
        let err = registry.resolve(&builtin_constructors(&config)).unwrap_err();
        assert!(matches!(err, RegistryError::Construction { ref module, .. } if module == "rotation"));
    }

    #[tokio::test]
    async fn test_command_module_builds_handler() {
        let temp = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.store_dir = temp.path().to_path_buf();
        let specs = vec![
            ModuleSpec::new("command", "runner")
                .handles(TaskKind::Test, None)
                .options(serde_json::json!({"workdir": temp.path().to_str().unwrap()})),
        ];

        let container = ModuleRegistry::from_specs(specs.clone())
            .unwrap()
            .resolve(&builtin_constructors(&config))
            .unwrap();
        let table = HandlerTable::from_container(&specs, &container).unwrap();
        assert!(table.lookup(TaskKind::Test, None).is_some());
    }

    #[test]
    fn test_command_module_rejects_bad_workdir() {
        let config = Config::default();
        let specs = vec![
            ModuleSpec::new("command", "runner").options(serde_json::json!({"workdir": "/definitely/not/here"})),
        ];
        let err = ModuleRegistry::from_specs(specs)
            .unwrap()
            .resolve(&builtin_constructors(&config))
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
