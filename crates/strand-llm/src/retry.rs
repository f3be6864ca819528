use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::warn;

use strand_core::config::{ModelConfig, RetryConfig};
use strand_core::error::{Result, StrandError};
use strand_core::retry::{exponential_backoff, with_jitter};
use strand_core::traits::LlmClient;
use strand_core::types::*;

/// An LLM client that retries failed request setup with jittered backoff.
///
/// Only opening the stream is retried. Once deltas flow, errors surface to
/// the caller so streamed text is never duplicated.
pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn LlmClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &StrandError) -> bool {
    match e {
        StrandError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("504")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        StrandError::LlmStream(_) => true,
        _ => false,
    }
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let tools = tools.to_vec();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;

            loop {
                match self.inner.chat_stream(&config, messages.clone(), &tools).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = with_jitter(exponential_backoff(
                            attempt,
                            self.retry_config.initial_backoff_ms,
                            self.retry_config.max_backoff_ms,
                        ));
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying LLM request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
