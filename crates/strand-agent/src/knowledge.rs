use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strand_core::traits::Retriever;
use strand_core::types::{ChatMessage, RetrievalQuery, Role};

/// Answer used when knowledge retrieval finds nothing and falling back to
/// the model's own knowledge is disabled.
pub const NO_KNOWLEDGE_MESSAGE: &str = "Sorry, I could not find anything relevant in the knowledge base. \
This assistant is configured to answer only from that knowledge, so I cannot answer this question. \
Try rephrasing it, or ask an administrator to add the missing material.";

/// Knowledge-base augmentation for one agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSettings {
    pub knowledge_base_ids: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: Option<f64>,
    /// Answer from the model's own knowledge when nothing is retrieved.
    #[serde(default = "default_true")]
    pub fallback_to_model: bool,
}

fn default_top_k() -> usize { 3 }
fn default_true() -> bool { true }

impl KnowledgeSettings {
    pub fn new(knowledge_base_ids: Vec<String>) -> Self {
        Self {
            knowledge_base_ids,
            top_k: default_top_k(),
            score_threshold: None,
            fallback_to_model: true,
        }
    }
}

/// Retrieve references for the last user message, formatted as numbered
/// entries. Returns an empty string when nothing is found or the backend fails.
pub async fn retrieve_references(
    retriever: &dyn Retriever,
    settings: &KnowledgeSettings,
    messages: &[ChatMessage],
) -> String {
    let Some(query) = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text())
        .filter(|q| !q.trim().is_empty())
    else {
        return String::new();
    };

    let request = RetrievalQuery {
        query,
        knowledge_base_ids: settings.knowledge_base_ids.clone(),
        top_k: settings.top_k,
        score_threshold: settings.score_threshold,
    };

    let chunks = match retriever.retrieve(request).await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!(error = %e, "Knowledge retrieval failed, continuing without references");
            return String::new();
        }
    };
    debug!(count = chunks.len(), "Retrieved knowledge references");

    chunks
        .iter()
        .filter(|c| settings.score_threshold.map_or(true, |t| c.score >= t))
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, c.content))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Append retrieved references to a system prompt.
pub fn augment_system_prompt(system_prompt: &str, references: &str) -> String {
    format!(
        "{system_prompt}\n\n## References\nThe following material was retrieved from the knowledge base. \
Use it when answering:\n\n{references}\n\n\
Answer using the references above and your own knowledge. If the references do not cover the question, \
answer from your own knowledge."
    )
}
