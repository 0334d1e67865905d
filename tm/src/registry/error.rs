//! Registry errors
//!
//! Every variant is fatal at assembly time.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Module '{0}' is already registered")]
    DuplicateName(String),

    #[error("Attr '{attr}' is exposed by both '{first}' and '{second}'")]
    DuplicateAttr { attr: String, first: String, second: String },

    #[error("Cyclic module dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Module '{module}' parameter '{param}' depends on unresolved attr '{attr}'")]
    UnresolvedDependency { module: String, param: String, attr: String },

    #[error("No constructor registered for module '{0}'")]
    MissingConstructor(String),

    #[error("No instance published under attr '{0}'")]
    MissingInstance(String),

    #[error("Module '{module}' has no dependency parameter '{param}'")]
    MissingParameter { module: String, param: String },

    #[error("Attr '{attr}' holds {actual}, not {expected}")]
    TypeMismatch {
        attr: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Failed to construct module '{module}': {reason}")]
    Construction { module: String, reason: String },
}
