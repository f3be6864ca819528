use serde_json::{json, Value};
use tracing::{debug, warn};

use strand_core::types::RetrievalQuery;

use crate::graph::config::KnowledgeConfig;
use crate::resolver::{resolve, value_to_text};
use crate::state::ExecutionState;

use super::{NodeContext, NodeOutcome};

/// Retrieval problems never fail the node: the output is empty and carries
/// the error text instead.
pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &KnowledgeConfig,
    state: &ExecutionState,
) -> NodeOutcome {
    let mut query = resolve(&config.query, state);
    if query.trim().is_empty() {
        query = state.inputs.get("query").map(value_to_text).unwrap_or_default();
    }

    let Some(retriever) = &ctx.services.retriever else {
        return empty("no retriever configured");
    };

    let request = RetrievalQuery {
        query,
        knowledge_base_ids: config.knowledge_base_ids.clone(),
        top_k: config.top_k,
        score_threshold: config.score_threshold,
    };
    match retriever.retrieve(request).await {
        Ok(chunks) => {
            let chunks: Vec<_> = chunks
                .into_iter()
                .filter(|c| config.score_threshold.map_or(true, |min| c.score >= min))
                .take(config.top_k)
                .collect();
            debug!(node_id = %ctx.node.id, count = chunks.len(), "Retrieved chunks");
            let context = chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let documents: Vec<Value> = chunks
                .iter()
                .map(|c| json!({"content": c.content, "score": c.score, "metadata": c.metadata}))
                .collect();
            NodeOutcome::new(json!({
                "context": context,
                "documents": documents,
                "count": documents.len(),
            }))
        }
        Err(e) => {
            warn!(node_id = %ctx.node.id, error = %e, "Knowledge retrieval failed");
            empty(&e.to_string())
        }
    }
}

fn empty(error: &str) -> NodeOutcome {
    NodeOutcome::new(json!({
        "context": "",
        "documents": [],
        "count": 0,
        "error": error,
    }))
}
