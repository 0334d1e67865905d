//! Routing keys to handler instances

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{RoutingKey, TaskKind};
use crate::registry::{Container, ModuleSpec, RegistryError};

use super::handler::TaskHandler;

/// Immutable map from `(kind, subtype)` to handler, built once after assembly
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<RoutingKey, (String, Arc<dyn TaskHandler>)>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .iter()
            .map(|((kind, subtype), (attr, _))| match subtype {
                Some(s) => format!("{}/{} -> {}", kind, s, attr),
                None => format!("{} -> {}", kind, attr),
            })
            .collect();
        keys.sort();
        f.debug_struct("HandlerTable").field("routes", &keys).finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every `handles` entry to the instance its module published
    pub fn from_container(specs: &[ModuleSpec], container: &Container) -> Result<Self, RegistryError> {
        debug!(specs = specs.len(), "HandlerTable::from_container: called");
        let mut table = Self::new();
        for spec in specs.iter().filter(|s| !s.handles.is_empty()) {
            let handler: Arc<dyn TaskHandler> = container.get(&spec.attr)?;
            for binding in &spec.handles {
                table.bind(
                    (binding.task_type, binding.subtype.clone()),
                    spec.attr.clone(),
                    handler.clone(),
                );
            }
        }
        Ok(table)
    }

    /// Bind a handler directly
    pub fn insert(&mut self, kind: TaskKind, subtype: Option<&str>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.bind((kind, subtype.map(str::to_string)), kind.to_string(), handler);
        self
    }

    fn bind(&mut self, key: RoutingKey, attr: String, handler: Arc<dyn TaskHandler>) {
        if let Some((previous, _)) = self.handlers.get(&key) {
            warn!(kind = %key.0, subtype = ?key.1, %previous, %attr, "Routing key bound twice, last binding wins");
        }
        self.handlers.insert(key, (attr, handler));
    }

    /// Exact `(kind, subtype)` first, then the kind-wide binding
    pub fn lookup(&self, kind: TaskKind, subtype: Option<&str>) -> Option<Arc<dyn TaskHandler>> {
        if let Some(s) = subtype
            && let Some((_, handler)) = self.handlers.get(&(kind, Some(s.to_string())))
        {
            return Some(handler.clone());
        }
        self.handlers.get(&(kind, None)).map(|(_, handler)| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{HandlerContext, HandlerError};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct Named(&'static str);

    #[async_trait]
    impl TaskHandler for Named {
        async fn execute(&self, _ctx: &HandlerContext, _payload: &Value) -> Result<Value, HandlerError> {
            Ok(json!(self.0))
        }
    }

    async fn name_of(table: &HandlerTable, kind: TaskKind, subtype: Option<&str>) -> Option<Value> {
        let handler = table.lookup(kind, subtype)?;
        let ctx = HandlerContext::new(
            "t",
            1,
            tokio_util::sync::CancellationToken::new(),
            std::time::Duration::from_secs(1),
        );
        handler.execute(&ctx, &Value::Null).await.ok()
    }

    #[tokio::test]
    async fn test_lookup_prefers_exact_subtype() {
        let mut table = HandlerTable::new();
        table
            .insert(TaskKind::Refactoring, None, Arc::new(Named("generic")))
            .insert(TaskKind::Refactoring, Some("extract_method"), Arc::new(Named("extract")));

        assert_eq!(
            name_of(&table, TaskKind::Refactoring, Some("extract_method")).await,
            Some(json!("extract"))
        );
        assert_eq!(
            name_of(&table, TaskKind::Refactoring, Some("rename")).await,
            Some(json!("generic"))
        );
        assert_eq!(name_of(&table, TaskKind::Refactoring, None).await, Some(json!("generic")));
        assert!(table.lookup(TaskKind::Analysis, None).is_none());
    }

    #[tokio::test]
    async fn test_from_container_binds_handles() {
        let spec = ModuleSpec::new("named", "named_handler")
            .handles(TaskKind::Test, None)
            .handles(TaskKind::Analysis, Some("security"));
        let mut container = Container::new();
        let handler: Arc<dyn TaskHandler> = Arc::new(Named("n"));
        container.insert("named_handler", handler);

        let table = HandlerTable::from_container(&[spec], &container).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.lookup(TaskKind::Test, Some("anything")).is_some());
        assert!(table.lookup(TaskKind::Analysis, Some("security")).is_some());
        assert!(table.lookup(TaskKind::Analysis, None).is_none());
    }

    #[test]
    fn test_from_container_wrong_type_fails() {
        let spec = ModuleSpec::new("named", "named_handler").handles(TaskKind::Test, None);
        let mut container = Container::new();
        container.insert("named_handler", Arc::new(1u8));

        assert!(matches!(
            HandlerTable::from_container(&[spec], &container),
            Err(RegistryError::TypeMismatch { .. })
        ));
    }
}
