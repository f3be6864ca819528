use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use strand_agent::{AgentEvent, AgentLoop, AgentRequest, AgentTerminal, KnowledgeSettings};
use strand_core::error::{Result, StrandError};

use crate::graph::config::AgentNodeConfig;
use crate::resolver::{resolve, value_to_text};
use crate::state::ExecutionState;

use super::{NodeContext, NodeOutcome};

/// Run a full tool-using agent loop inside the node, forwarding its text as
/// progress chunks.
pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &AgentNodeConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let mut query = resolve(&config.query, state);
    if query.trim().is_empty() {
        query = state.inputs.get("query").map(value_to_text).unwrap_or_default();
    }

    let mut request = AgentRequest::new(ctx.services.model_for(config.model.as_ref()), query);
    request.run_id = ctx.run_id.clone();
    request.system_prompt = Some(resolve(&config.instructions, state)).filter(|s| !s.trim().is_empty());
    request.enabled_tools = config.enabled_tools.clone();
    request.mcp_servers = config.mcp_servers.clone();
    request.max_iterations = config.max_iterations.max(1);
    if !config.knowledge_base_ids.is_empty() {
        let mut knowledge = KnowledgeSettings::new(config.knowledge_base_ids.clone());
        if let Some(options) = &config.knowledge_settings {
            knowledge.top_k = options.top_k;
            knowledge.score_threshold = options.score_threshold;
            knowledge.fallback_to_model = options.fallback_to_model;
        }
        request.knowledge = Some(knowledge);
    }

    let mut agent = AgentLoop::new(ctx.services.llm.clone(), ctx.services.tools.clone())
        .with_mcp_servers(ctx.services.mcp_servers.clone());
    if let Some(retriever) = &ctx.services.retriever {
        agent = agent.with_retriever(retriever.clone());
    }
    if let Some(cancel) = ctx.cancel {
        agent = agent.with_cancel(cancel.clone());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = async move { agent.run(request, &tx).await };
    let forward = async {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Text { content } => ctx.emit_chunk(content),
                AgentEvent::Trace { name, .. } => {
                    debug!(node_id = %ctx.node.id, tool = %name, "Agent tool call");
                }
                _ => {}
            }
        }
    };
    let (outcome, ()) = tokio::join!(run, forward);

    if let AgentTerminal::Error(message) = &outcome.terminal {
        if ctx.cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(StrandError::Cancelled);
        }
        return Err(StrandError::NodeExecution {
            node_id: ctx.node.id.clone(),
            message: message.clone(),
        });
    }

    Ok(NodeOutcome::new(json!({
        "answer": outcome.answer,
        "tool_results": outcome.tool_results,
        "iterations": outcome.iterations,
    })))
}
