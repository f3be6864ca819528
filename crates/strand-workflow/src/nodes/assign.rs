use serde_json::{Map, Value};

use crate::graph::config::{AssignConfig, VariableScope};
use crate::resolver::resolve_value;
use crate::state::{ExecutionState, StateEffect};

use super::NodeOutcome;

/// Resolve each assignment (keeping JSON types for single references) and
/// write it to the run or conversation variable scope.
pub(super) fn execute(config: &AssignConfig, state: &ExecutionState) -> NodeOutcome {
    let mut assigned = Map::new();
    let mut effects = Vec::new();
    for assignment in &config.assignments {
        if assignment.variable.is_empty() {
            continue;
        }
        let value = match &assignment.value {
            Value::String(template) => resolve_value(template, state),
            other => crate::resolver::resolve_deep(other, state),
        };
        assigned.insert(assignment.variable.clone(), value.clone());
        let key = assignment.variable.clone();
        effects.push(match assignment.scope {
            VariableScope::Variable => StateEffect::Variable { key, value },
            VariableScope::Conversation => StateEffect::ConversationVariable { key, value },
        });
    }
    NodeOutcome {
        output: Value::Object(assigned),
        effects,
    }
}
