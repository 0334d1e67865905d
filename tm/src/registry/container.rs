//! Typed instance container and factory registration

use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::debug;

use super::RegistryError;

/// A built module, type-erased
pub(super) struct Instance {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Instance {
    fn new<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Built modules keyed by attr
///
/// Populated during assembly and read-only afterwards. Values are stored by
/// their concrete type (usually an `Arc<...>`), and `get` hands out clones.
#[derive(Default)]
pub struct Container {
    instances: HashMap<String, Instance>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut attrs: Vec<_> = self.instances.iter().map(|(k, v)| (k.as_str(), v.type_name)).collect();
        attrs.sort();
        f.debug_struct("Container").field("instances", &attrs).finish()
    }
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an instance under `attr`, replacing any previous one
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, attr: impl Into<String>, value: T) {
        let attr = attr.into();
        debug!(%attr, type_name = std::any::type_name::<T>(), "Container::insert: called");
        self.instances.insert(attr, Instance::new(value));
    }

    /// Fetch a clone of the instance under `attr`
    pub fn get<T: Clone + 'static>(&self, attr: &str) -> Result<T, RegistryError> {
        let instance = self
            .instances
            .get(attr)
            .ok_or_else(|| RegistryError::MissingInstance(attr.to_string()))?;
        instance
            .value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch {
                attr: attr.to_string(),
                expected: std::any::type_name::<T>(),
                actual: instance.type_name,
            })
    }

    pub(super) fn insert_instance(&mut self, attr: String, instance: Instance) {
        debug!(%attr, type_name = instance.type_name, "Container::insert_instance: called");
        self.instances.insert(attr, instance);
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.instances.contains_key(attr)
    }

    /// Attrs in sorted order
    pub fn attrs(&self) -> Vec<&str> {
        let mut attrs: Vec<&str> = self.instances.keys().map(String::as_str).collect();
        attrs.sort_unstable();
        attrs
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Resolved dependencies handed to a factory
pub struct Dependencies<'a> {
    module: &'a str,
    deps: &'a BTreeMap<String, String>,
    options: &'a Value,
    container: &'a Container,
}

impl<'a> Dependencies<'a> {
    pub(crate) fn new(
        module: &'a str,
        deps: &'a BTreeMap<String, String>,
        options: &'a Value,
        container: &'a Container,
    ) -> Self {
        Self {
            module,
            deps,
            options,
            container,
        }
    }

    /// Name of the module being built
    pub fn module(&self) -> &str {
        self.module
    }

    /// The dependency bound to constructor parameter `param`
    pub fn get<T: Clone + 'static>(&self, param: &str) -> Result<T, RegistryError> {
        let attr = self.deps.get(param).ok_or_else(|| RegistryError::MissingParameter {
            module: self.module.to_string(),
            param: param.to_string(),
        })?;
        self.container.get::<T>(attr)
    }

    /// Like `get`, but `None` when the parameter was not wired
    pub fn optional<T: Clone + 'static>(&self, param: &str) -> Result<Option<T>, RegistryError> {
        match self.deps.get(param) {
            Some(attr) => self.container.get::<T>(attr).map(Some),
            None => Ok(None),
        }
    }

    /// The module's `options` block
    pub fn options(&self) -> &Value {
        self.options
    }
}

type Factory = Box<dyn Fn(&Dependencies<'_>) -> eyre::Result<Instance> + Send + Sync>;

/// Factories keyed by constructor name
#[derive(Default)]
pub struct Constructors {
    factories: HashMap<String, Factory>,
}

impl Constructors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed factory; the produced `T` is what dependents `get`
    pub fn register<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Dependencies<'_>) -> eyre::Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, type_name = std::any::type_name::<T>(), "Constructors::register: called");
        self.factories
            .insert(name, Box::new(move |deps: &Dependencies<'_>| factory(deps).map(Instance::new)));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub(super) fn build(&self, name: &str, deps: &Dependencies<'_>) -> Result<Instance, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::MissingConstructor(name.to_string()))?;
        factory(deps).map_err(|e| RegistryError::Construction {
            module: deps.module().to_string(),
            reason: e.chain().map(|c| c.to_string()).collect::<Vec<_>>().join(": "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_container_typed_get() {
        let mut container = Container::new();
        container.insert("answer", Arc::new(42u32));

        let value: Arc<u32> = container.get("answer").unwrap();
        assert_eq!(*value, 42);
    }

    #[test]
    fn test_container_type_mismatch() {
        let mut container = Container::new();
        container.insert("answer", Arc::new(42u32));

        let err = container.get::<Arc<String>>("answer").unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    }

    #[test]
    fn test_container_missing_instance() {
        let container = Container::new();
        assert!(matches!(
            container.get::<Arc<u32>>("nothing"),
            Err(RegistryError::MissingInstance(attr)) if attr == "nothing"
        ));
    }

    #[test]
    fn test_dependencies_missing_parameter() {
        let container = Container::new();
        let deps = BTreeMap::new();
        let options = Value::Null;
        let resolved = Dependencies::new("m", &deps, &options, &container);

        assert!(matches!(
            resolved.get::<Arc<u32>>("x"),
            Err(RegistryError::MissingParameter { .. })
        ));
        assert!(resolved.optional::<Arc<u32>>("x").unwrap().is_none());
    }
}
