use serde_json::{json, Map, Value};

use crate::graph::config::{AnswerConfig, EndConfig, OutputMapping};
use crate::resolver::{resolve, value_to_text};
use crate::state::{ExecutionState, StateEffect};

use super::{NodeContext, NodeOutcome};

pub(super) fn execute_answer(
    ctx: &NodeContext<'_>,
    config: &AnswerConfig,
    state: &ExecutionState,
) -> NodeOutcome {
    let answer = if config.answer.trim().is_empty() {
        upstream_text(ctx, state)
    } else {
        resolve(&config.answer, state)
    };

    for chunk in answer.split_inclusive(char::is_whitespace) {
        ctx.emit_chunk(chunk);
    }

    NodeOutcome::new(json!({"answer": answer})).with_effect(StateEffect::FinalAnswer(answer))
}

/// Text of the first predecessor, or of the latest output when the answer
/// node has no incoming edge.
fn upstream_text(ctx: &NodeContext<'_>, state: &ExecutionState) -> String {
    let sources = ctx.graph.incoming_sources(&ctx.node.id);
    let output = match sources.first() {
        Some(source) => state.output(source),
        None => state.last_output(),
    };
    match output {
        Some(Value::Object(obj)) => obj
            .get("text")
            .map(value_to_text)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => value_to_text(other),
        None => String::new(),
    }
}

pub(super) fn execute_end(ctx: &NodeContext<'_>, config: &EndConfig, state: &ExecutionState) -> NodeOutcome {
    let mut collected = Map::new();
    if config.outputs.is_empty() {
        for source in ctx.graph.incoming_sources(&ctx.node.id) {
            if let Some(output) = state.output(source) {
                collected.insert(source.to_string(), output.clone());
            }
        }
    } else {
        for mapping in &config.outputs {
            collected.insert(mapping.variable_name.clone(), select(mapping, state));
        }
    }

    let output = Value::Object(collected);
    NodeOutcome::new(output.clone()).with_effect(StateEffect::WorkflowOutput(output))
}

/// `[node, key]` reads `key` from the node's output, falling back to its
/// `text` field and then to an empty string.
fn select(mapping: &OutputMapping, state: &ExecutionState) -> Value {
    let (node_id, key) = match mapping.variable_selector.as_slice() {
        [] => return json!(""),
        [node_id] => (node_id, None),
        [node_id, key, ..] => (node_id, Some(key)),
    };
    match (state.output(node_id), key) {
        (Some(Value::Object(obj)), Some(key)) => obj
            .get(key.as_str())
            .or_else(|| obj.get("text"))
            .cloned()
            .unwrap_or_else(|| json!("")),
        (Some(output), _) => output.clone(),
        (None, _) => json!(""),
    }
}
