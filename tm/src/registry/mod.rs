//! Module registry
//!
//! Assembles the running system from declarative [`ModuleSpec`]s. Each spec
//! names a constructor, the attr under which its instance is published, and
//! the attrs it depends on. Resolution sorts the specs topologically, fails
//! fast on cycles and dangling references, then builds every module in order
//! into a read-only [`Container`].

mod container;
mod error;
mod resolver;
mod spec;

pub use container::{Constructors, Container, Dependencies};
pub use error::RegistryError;
pub use resolver::{ModuleRegistry, topological_order};
pub use spec::{HandlerBinding, ModuleSpec};
