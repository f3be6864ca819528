use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Streaming chat completion with optional tool binding.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// One invocable capability, local or proxied.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Name of the remote server this tool is proxied through, if any.
    fn remote_server(&self) -> Option<&str> {
        None
    }
}

/// Read-only ranked lookup over knowledge bases.
pub trait Retriever: Send + Sync + 'static {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>>;
}

/// Best-effort persistence of run and node status.
///
/// Callers log and discard any error returned here.
pub trait RunRecorder: Send + Sync + 'static {
    fn record_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>>;

    fn record_node(&self, record: NodeRecord) -> BoxFuture<'_, Result<()>>;
}

/// Recorder that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl RunRecorder for NoopRecorder {
    fn record_run(&self, _record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn record_node(&self, _record: NodeRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
