use serde_json::{json, Map, Value};
use tracing::warn;

use strand_core::error::Result;
use strand_core::types::ChatMessage;

use crate::graph::config::{ExtractorConfig, ParamSpec};
use crate::resolver::{resolve, value_to_text};
use crate::state::ExecutionState;

use super::{complete, NodeContext, NodeOutcome};

/// Ask the model for a JSON object holding the declared parameters.
///
/// A reply that is not a JSON object degrades to `success: false`; only
/// model transport failures fail the node.
pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &ExtractorConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let mut input = resolve(&config.input_text, state);
    if input.trim().is_empty() {
        input = state.inputs.get("input").map(value_to_text).unwrap_or_default();
    }

    let model = ctx.services.model_for(config.model.as_ref());
    let messages = vec![
        ChatMessage::system(extraction_prompt(&config.parameters, config.instruction.as_deref())),
        ChatMessage::user(format!("Text:\n{}", input)),
    ];
    let raw = complete(ctx, &model, messages, false).await?;

    let output = match parse_object(&raw) {
        Ok(extracted) => {
            let missing: Vec<&str> = config
                .parameters
                .iter()
                .filter(|p| p.required && extracted.get(&p.name).map_or(true, Value::is_null))
                .map(|p| p.name.as_str())
                .collect();
            if missing.is_empty() {
                json!({"extracted": extracted, "raw_response": raw, "success": true})
            } else {
                json!({
                    "extracted": extracted,
                    "raw_response": raw,
                    "success": false,
                    "error": format!("missing required parameters: {}", missing.join(", ")),
                })
            }
        }
        Err(e) => {
            warn!(node_id = %ctx.node.id, error = %e, "Extraction reply was not usable JSON");
            json!({"extracted": {}, "raw_response": raw, "success": false, "error": e})
        }
    };
    Ok(NodeOutcome::new(output))
}

fn extraction_prompt(parameters: &[ParamSpec], instruction: Option<&str>) -> String {
    let mut prompt = String::from("Extract the following parameters from the text and return them as JSON.\n\nParameters:\n");
    for p in parameters {
        prompt.push_str(&format!("- {}: {} (type: {})", p.name, p.description, p.param_type));
        if p.required {
            prompt.push_str(" [required]");
        }
        prompt.push('\n');
    }
    if let Some(instruction) = instruction.map(str::trim).filter(|i| !i.is_empty()) {
        prompt.push('\n');
        prompt.push_str(instruction);
        prompt.push('\n');
    }
    prompt.push_str("\nReturn only the JSON object with no other text.");
    prompt
}

/// Parse a reply, dropping a surrounding Markdown code fence.
fn parse_object(raw: &str) -> std::result::Result<Map<String, Value>, String> {
    let mut text = raw.trim();
    let unfenced;
    if text.starts_with("```") {
        let lines: Vec<&str> = text.lines().collect();
        let end = if lines.len() > 1 && lines[lines.len() - 1].trim_start().starts_with("```") {
            lines.len() - 1
        } else {
            lines.len()
        };
        unfenced = lines[1.min(end)..end].join("\n");
        text = unfenced.trim();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("Expected a JSON object in the model response".to_string()),
        Err(_) => Err("Failed to parse JSON from the model response".to_string()),
    }
}
