use serde_json::json;
use tracing::debug;

use strand_core::error::Result;
use strand_core::types::ChatMessage;

use crate::graph::config::LlmConfig;
use crate::resolver::{resolve, value_to_text};
use crate::state::ExecutionState;

use super::{complete, NodeContext, NodeOutcome};

pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &LlmConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let mut prompt = resolve(&config.prompt, state);
    if prompt.trim().is_empty() {
        prompt = state.inputs.get("input").map(value_to_text).unwrap_or_default();
    }

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = config.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(ChatMessage::system(resolve(system, state)));
    }
    messages.push(ChatMessage::user(prompt));

    let model = ctx.services.model_for(config.model.as_ref());
    debug!(node_id = %ctx.node.id, model = %model.model_id, "Calling model");
    let text = complete(ctx, &model, messages, true).await?;
    Ok(NodeOutcome::new(json!({"text": text})))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strand_core::types::Role;
    use strand_test_utils::{ScriptedLlm, ScriptedTurn};

    use super::super::test_support::{state_with, Harness};

    #[tokio::test]
    async fn test_llm_streams_chunks_and_outputs_text() {
        let mut h = Harness::new(
            "llm",
            json!({"prompt": "Summarise {{doc}}", "system_prompt": "Be brief"}),
            ScriptedLlm::new(vec![ScriptedTurn::text("Short summary")]),
        );
        let out = h.run("n", &state_with(json!({"doc": "the text"}))).await.unwrap().output;
        assert_eq!(out, json!({"text": "Short summary"}));
        assert_eq!(h.chunks().concat(), "Short summary");
    }

    #[tokio::test]
    async fn test_empty_prompt_falls_back_to_input() {
        let h = Harness::new("llm", json!({}), ScriptedLlm::new(vec![ScriptedTurn::text("ok")]));
        h.run("n", &state_with(json!({"input": "hello there"}))).await.unwrap();
        let request = &h.llm.requests()[0];
        assert_eq!(request.len(), 1);
        assert_eq!(request[0].role, Role::User);
        assert_eq!(request[0].text(), "hello there");
    }

    #[tokio::test]
    async fn test_model_failure_fails_node() {
        let h = Harness::new(
            "llm",
            json!({"prompt": "x"}),
            ScriptedLlm::new(vec![ScriptedTurn::fail("HTTP 503")]),
        );
        let err = h.run("n", &state_with(json!({}))).await.unwrap_err();
        assert!(err.is_transport());
    }
}
