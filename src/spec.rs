//! Declarative per-task specifications and their binding documents.
//!
//! A specification only names things: which inputs must be present and whether
//! the task must produce a result. Payload contents are the handler's business.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::protocol::TaskKey;

/// A required input, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequirement {
    pub name: String,
}

/// A declared output. Any declared output makes a non-empty result mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequirement {
    pub name: String,
}

/// Input/output contract bound to one (kind, version).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpecification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<InputRequirement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputRequirement>>,
}

impl TaskSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required input.
    pub fn require_input(mut self, name: impl Into<String>) -> Self {
        self.inputs
            .get_or_insert_with(Vec::new)
            .push(InputRequirement { name: name.into() });
        self
    }

    /// Declare an output, making a result mandatory.
    pub fn declare_output(mut self, name: impl Into<String>) -> Self {
        self.outputs
            .get_or_insert_with(Vec::new)
            .push(OutputRequirement { name: name.into() });
        self
    }

    /// Required input names in declaration order.
    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .flatten()
            .map(|requirement| requirement.name.as_str())
    }

    pub fn requires_output(&self) -> bool {
        self.outputs.as_ref().is_some_and(|outputs| !outputs.is_empty())
    }
}

/// One entry of a binding document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecBinding {
    pub kind: String,
    pub version: String,
    pub spec: TaskSpecification,
}

impl SpecBinding {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.kind, &self.version)
    }
}

/// Read a JSON array of bindings from disk.
pub fn load_bindings(path: &Path) -> Result<Vec<SpecBinding>, SpecError> {
    let text = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SpecError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
