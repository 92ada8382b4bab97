//! Structural validation of assignments and results against a specification.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::protocol::{TaskAssignment, TaskResult};
use crate::spec::TaskSpecification;

/// Check that every required input name appears in the assignment.
///
/// A descriptor counts as present even without a payload. Missing names are
/// reported once each, in the specification's declaration order.
pub fn validate_inputs(
    spec: &TaskSpecification,
    assignment: &TaskAssignment,
) -> Result<(), ValidationError> {
    let present: HashSet<&str> = assignment.inputs.iter().map(|i| i.name.as_str()).collect();

    let mut seen = HashSet::new();
    let missing: Vec<String> = spec
        .required_inputs()
        .filter(|name| !present.contains(name) && seen.insert(*name))
        .map(str::to_string)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingInputs {
            task: assignment.key(),
            missing,
        })
    }
}

/// Check that a result is present when the specification declares outputs.
pub fn validate_outputs(
    spec: &TaskSpecification,
    assignment: &TaskAssignment,
    result: &TaskResult,
) -> Result<(), ValidationError> {
    if spec.requires_output() && result.is_empty() {
        return Err(ValidationError::MissingOutput {
            task: assignment.key(),
        });
    }
    Ok(())
}
