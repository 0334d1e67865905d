//! Declarative module records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::TaskKind;

/// One module of the wiring
///
/// ```yaml
/// - name: completion
///   attr: completion_handler
///   deps:
///     backend: llm
///     rotation: rotation
///   handles:
///     - type: analysis
///     - type: refactoring
///       subtype: extract_method
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Registry key, also the constructor name unless `constructor` is set
    pub name: String,

    /// Name the built instance is published under
    pub attr: String,

    /// Constructor to invoke when several modules share one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor: Option<String>,

    /// Constructor parameter -> attr of another module
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deps: BTreeMap<String, String>,

    /// Task routing keys this module handles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handles: Vec<HandlerBinding>,

    /// Free-form constructor options
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attr: attr.into(),
            constructor: None,
            deps: BTreeMap::new(),
            handles: Vec::new(),
            options: Value::Null,
        }
    }

    pub fn dep(mut self, param: impl Into<String>, attr: impl Into<String>) -> Self {
        self.deps.insert(param.into(), attr.into());
        self
    }

    pub fn handles(mut self, kind: TaskKind, subtype: Option<&str>) -> Self {
        self.handles.push(HandlerBinding {
            task_type: kind,
            subtype: subtype.map(str::to_string),
        });
        self
    }

    pub fn constructor(mut self, constructor: impl Into<String>) -> Self {
        self.constructor = Some(constructor.into());
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn constructor_name(&self) -> &str {
        self.constructor.as_deref().unwrap_or(&self.name)
    }
}

/// A `(type, subtype)` routing key bound to a handler module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerBinding {
    #[serde(rename = "type")]
    pub task_type: TaskKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
- name: gemini
  attr: llm
- name: completion
  attr: completion_handler
  deps:
    backend: llm
  handles:
    - type: analysis
    - type: refactoring
      subtype: extract_method
"#;
        let specs: Vec<ModuleSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].deps.is_empty());
        assert_eq!(specs[1].deps.get("backend").map(String::as_str), Some("llm"));
        assert_eq!(specs[1].handles[1].task_type, TaskKind::Refactoring);
        assert_eq!(specs[1].handles[1].subtype.as_deref(), Some("extract_method"));
        assert_eq!(specs[1].constructor_name(), "completion");
    }

    #[test]
    fn test_builder_matches_yaml_form() {
        let built = ModuleSpec::new("command", "shell").constructor("command_runner").handles(TaskKind::Test, None);
        assert_eq!(built.constructor_name(), "command_runner");
        assert_eq!(built.handles.len(), 1);
    }
}
