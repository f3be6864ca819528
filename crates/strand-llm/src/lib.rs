pub mod openai;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use strand_core::config::ModelConfig;
use strand_core::traits::LlmClient;

pub use openai::OpenAiClient;
pub use retry::RetryingClient;

/// Build the client for a model config, wrapped in retry when configured.
///
/// Every provider is reached through the OpenAI-compatible chat endpoint;
/// `base_url` selects the backend.
pub fn create_client(config: &ModelConfig) -> Arc<dyn LlmClient> {
    let base: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new());
    match &config.retry {
        Some(retry) => Arc::new(RetryingClient::new(base, retry.clone())),
        None => base,
    }
}
