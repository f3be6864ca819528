use serde_json::json;

use crate::graph::config::TemplateConfig;
use crate::resolver::resolve;
use crate::state::ExecutionState;

use super::NodeOutcome;

pub(super) fn execute(config: &TemplateConfig, state: &ExecutionState) -> NodeOutcome {
    NodeOutcome::new(json!({"output": resolve(&config.template, state)}))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::{no_llm, state_with, Harness};

    #[tokio::test]
    async fn test_template_resolves() {
        let h = Harness::new("template", json!({"template": "Dear {{name}},"}), no_llm());
        let outcome = h.run("n", &state_with(json!({"name": "Ada"}))).await.unwrap();
        assert_eq!(outcome.output, json!({"output": "Dear Ada,"}));
    }
}
