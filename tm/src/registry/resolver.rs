//! Dependency-ordered assembly

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::{Constructors, Container, Dependencies, ModuleSpec, RegistryError};

/// Pending module specs plus pre-built instances
///
/// Exists only for the assembly phase; `resolve` produces the container the
/// rest of the system reads from.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    specs: Vec<ModuleSpec>,
    provided: Container,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a wiring list
    pub fn from_specs(specs: impl IntoIterator<Item = ModuleSpec>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Add a spec to the pending set
    pub fn register(&mut self, spec: ModuleSpec) -> Result<(), RegistryError> {
        debug!(name = %spec.name, attr = %spec.attr, deps = ?spec.deps, "ModuleRegistry::register: called");
        if self.specs.iter().any(|s| s.name == spec.name) {
            warn!(name = %spec.name, "Module already registered");
            return Err(RegistryError::DuplicateName(spec.name));
        }
        if let Some(existing) = self.specs.iter().find(|s| s.attr == spec.attr) {
            return Err(RegistryError::DuplicateAttr {
                attr: spec.attr.clone(),
                first: existing.name.clone(),
                second: spec.name,
            });
        }
        self.specs.push(spec);
        Ok(())
    }

    /// Seed an already-built instance that specs may depend on
    pub fn provide<T: Clone + Send + Sync + 'static>(&mut self, attr: impl Into<String>, value: T) {
        self.provided.insert(attr, value);
    }

    pub fn specs(&self) -> &[ModuleSpec] {
        &self.specs
    }

    /// Build every module in dependency order
    ///
    /// Validation and ordering happen before any factory runs, so a cyclic or
    /// dangling wiring constructs nothing.
    pub fn resolve(self, constructors: &Constructors) -> Result<Container, RegistryError> {
        debug!(spec_count = self.specs.len(), "ModuleRegistry::resolve: called");
        self.validate(constructors)?;
        let order = topological_order(&self.specs)?;
        debug!(?order, "ModuleRegistry::resolve: build order");

        let mut container = self.provided;
        for idx in order {
            let spec = &self.specs[idx];
            for (param, attr) in &spec.deps {
                if !container.contains(attr) {
                    return Err(RegistryError::UnresolvedDependency {
                        module: spec.name.clone(),
                        param: param.clone(),
                        attr: attr.clone(),
                    });
                }
            }

            let instance = {
                let deps = Dependencies::new(&spec.name, &spec.deps, &spec.options, &container);
                constructors.build(spec.constructor_name(), &deps)?
            };
            container.insert_instance(spec.attr.clone(), instance);
            debug!(name = %spec.name, attr = %spec.attr, "ModuleRegistry::resolve: module built");
        }

        info!(modules = self.specs.len(), instances = container.len(), "Module assembly complete");
        Ok(container)
    }

    fn validate(&self, constructors: &Constructors) -> Result<(), RegistryError> {
        let attrs: HashSet<&str> = self.specs.iter().map(|s| s.attr.as_str()).collect();

        for spec in &self.specs {
            if self.provided.contains(&spec.attr) {
                return Err(RegistryError::DuplicateAttr {
                    attr: spec.attr.clone(),
                    first: "<provided>".to_string(),
                    second: spec.name.clone(),
                });
            }
            if !constructors.contains(spec.constructor_name()) {
                return Err(RegistryError::MissingConstructor(spec.constructor_name().to_string()));
            }
            for (param, attr) in &spec.deps {
                if !attrs.contains(attr.as_str()) && !self.provided.contains(attr) {
                    return Err(RegistryError::UnresolvedDependency {
                        module: spec.name.clone(),
                        param: param.clone(),
                        attr: attr.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order specs so every dependency precedes its dependents
///
/// Returns indices into `specs`. Edges go from a spec to the specs publishing
/// the attrs in its `deps`; attrs no spec publishes are ignored here. A back
/// edge fails with the cycle path, first module repeated at the end.
pub fn topological_order(specs: &[ModuleSpec]) -> Result<Vec<usize>, RegistryError> {
    debug!(spec_count = specs.len(), "topological_order: called");
    let by_attr: HashMap<&str, usize> = specs.iter().enumerate().map(|(i, s)| (s.attr.as_str(), i)).collect();

    let mut marks: HashMap<usize, Mark> = HashMap::new();
    let mut path = Vec::new();
    let mut order = Vec::with_capacity(specs.len());

    for idx in 0..specs.len() {
        visit(idx, specs, &by_attr, &mut marks, &mut path, &mut order)?;
    }

    debug!(?order, "topological_order: complete");
    Ok(order)
}

fn visit(
    idx: usize,
    specs: &[ModuleSpec],
    by_attr: &HashMap<&str, usize>,
    marks: &mut HashMap<usize, Mark>,
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), RegistryError> {
    match marks.get(&idx) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|&p| p == idx).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|&i| specs[i].name.clone()).collect();
            cycle.push(specs[idx].name.clone());
            debug!(?cycle, "visit: back edge found - cycle detected");
            return Err(RegistryError::CyclicDependency { cycle });
        }
        None => {}
    }

    marks.insert(idx, Mark::Visiting);
    path.push(idx);

    for attr in specs[idx].deps.values() {
        if let Some(&dep_idx) = by_attr.get(attr.as_str()) {
            visit(dep_idx, specs, by_attr, marks, path, order)?;
        }
    }

    path.pop();
    marks.insert(idx, Mark::Done);
    order.push(idx);
    Ok(())
}
