use serde_json::{json, Value};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::types::ToolContext;

use crate::graph::config::ToolNodeConfig;
use crate::resolver::resolve_deep;
use crate::state::ExecutionState;

use super::{NodeContext, NodeOutcome};

pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &ToolNodeConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let name = config.tool_name.as_str();
    if !ctx.services.tools.contains(name) {
        return Err(StrandError::Config(format!(
            "tool node '{}': unknown tool '{}'",
            ctx.node.id, name
        )));
    }

    let params = resolve_deep(&Value::Object(config.tool_parameters.clone()), state);
    debug!(node_id = %ctx.node.id, tool = name, "Invoking tool");
    let result = ctx
        .services
        .tools
        .execute(name, params, ToolContext::new(ctx.run_id.clone()))
        .await?;

    if result.is_error {
        return Err(StrandError::ToolExecution {
            tool: name.to_string(),
            message: result.content,
        });
    }

    let output = match serde_json::from_str::<Value>(&result.content) {
        Ok(object @ Value::Object(_)) => object,
        _ => json!({"result": result.content}),
    };
    Ok(NodeOutcome::new(output))
}
