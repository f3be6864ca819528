use serde_json::json;

use strand_core::error::Result;
use strand_core::types::ChatMessage;

use crate::graph::config::{ClassSpec, ClassifierConfig};
use crate::resolver::{resolve, value_to_text};
use crate::state::{ExecutionState, StateEffect, SELECTED_BRANCH_KEY};

use super::{complete, NodeContext, NodeOutcome};

/// Ask the model for one class id; the chosen id becomes the branch.
pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &ClassifierConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let mut query = resolve(&config.query_variable, state);
    if query.trim().is_empty() || (query == config.query_variable && query.contains("{{")) {
        query = state.inputs.get("query").map(value_to_text).unwrap_or_default();
    }

    let mut model = ctx.services.model_for(config.model.as_ref());
    model.temperature = 0.0;
    let messages = vec![
        ChatMessage::system(classifier_prompt(&config.classes, &config.instruction)),
        ChatMessage::user(query.clone()),
    ];
    let answer = complete(ctx, &model, messages, false).await?;

    let class = pick_class(&config.classes, answer.trim());
    let output = json!({
        "class_id": class.id,
        "class_name": class.name,
        "query": query,
        "branch_id": class.id,
    });
    Ok(NodeOutcome::new(output).with_effect(StateEffect::Temp {
        key: SELECTED_BRANCH_KEY.into(),
        value: json!(class.id),
    }))
}

fn classifier_prompt(classes: &[ClassSpec], instruction: &str) -> String {
    let listing: Vec<String> = classes
        .iter()
        .map(|c| {
            if c.description.is_empty() {
                format!("- {}: {}", c.id, c.name)
            } else {
                format!("- {}: {} ({})", c.id, c.name, c.description)
            }
        })
        .collect();
    let mut prompt = format!(
        "You are a question classifier. Put the user's question into exactly one of these categories.\n\nCategories:\n{}\n",
        listing.join("\n")
    );
    if !instruction.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(instruction.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nReturn only the category id and nothing else.");
    prompt
}

/// Exact id, then id or lowercased name contained in the answer, then the
/// first class.
fn pick_class<'a>(classes: &'a [ClassSpec], answer: &str) -> &'a ClassSpec {
    if let Some(exact) = classes.iter().find(|c| c.id == answer) {
        return exact;
    }
    let lowered = answer.to_lowercase();
    classes
        .iter()
        .find(|c| {
            lowered.contains(&c.id.to_lowercase())
                || (!c.name.is_empty() && lowered.contains(&c.name.to_lowercase()))
        })
        .unwrap_or(&classes[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_test_utils::{ScriptedLlm, ScriptedTurn};

    use super::super::test_support::{state_with, Harness};

    fn data() -> serde_json::Value {
        json!({
            "query_variable": "{{question}}",
            "classes": [
                {"id": "tech", "name": "Technical", "description": "bugs and errors"},
                {"id": "sales", "name": "Sales"}
            ]
        })
    }

    fn classes() -> Vec<ClassSpec> {
        serde_json::from_value(data()["classes"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_exact_id_selects_branch() {
        let h = Harness::new(
            "question-classifier",
            data(),
            ScriptedLlm::new(vec![ScriptedTurn::text("sales")]),
        );
        let outcome = h.run("n", &state_with(json!({"question": "How much?"}))).await.unwrap();
        assert_eq!(
            outcome.output,
            json!({"class_id": "sales", "class_name": "Sales", "query": "How much?", "branch_id": "sales"})
        );
        assert_eq!(
            outcome.effects,
            vec![StateEffect::Temp { key: SELECTED_BRANCH_KEY.into(), value: json!("sales") }]
        );
    }

    #[tokio::test]
    async fn test_query_falls_back_to_inputs_query() {
        let h = Harness::new(
            "classifier",
            data(),
            ScriptedLlm::new(vec![ScriptedTurn::text("tech")]),
        );
        let out = h.run("n", &state_with(json!({"query": "it crashed"}))).await.unwrap().output;
        assert_eq!(out["query"], "it crashed");
    }

    #[test]
    fn test_fuzzy_and_default_matching() {
        let classes = classes();
        assert_eq!(pick_class(&classes, "The answer is SALES.").id, "sales");
        assert_eq!(pick_class(&classes, "probably technical").id, "tech");
        assert_eq!(pick_class(&classes, "no idea").id, "tech");
    }

    #[test]
    fn test_prompt_lists_classes() {
        let prompt = classifier_prompt(&classes(), "Prefer sales when unsure");
        assert!(prompt.contains("- tech: Technical (bugs and errors)"));
        assert!(prompt.contains("- sales: Sales\n"));
        assert!(prompt.contains("Prefer sales when unsure"));
        assert!(prompt.ends_with("Return only the category id and nothing else."));
    }
}
