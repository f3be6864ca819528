use serde_json::Value;

use crate::graph::config::StartConfig;
use crate::state::{ExecutionState, StateEffect};

use super::NodeOutcome;

/// Seed declared defaults for absent inputs; the output is the effective
/// input map.
pub(super) fn execute(config: &StartConfig, state: &ExecutionState) -> NodeOutcome {
    let mut effective = state.inputs.clone();
    let mut effects = Vec::new();
    for var in &config.variables {
        if var.variable.is_empty() || var.default.is_null() || effective.contains_key(&var.variable) {
            continue;
        }
        effective.insert(var.variable.clone(), var.default.clone());
        effects.push(StateEffect::SeedInput {
            key: var.variable.clone(),
            value: var.default.clone(),
        });
    }
    NodeOutcome {
        output: Value::Object(effective),
        effects,
    }
}
