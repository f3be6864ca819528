use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{Retriever, Tool};
use strand_core::types::{RetrievalQuery, RetrievedChunk, ToolContext, ToolResult};

type ToolFn = dyn Fn(serde_json::Value) -> Result<String> + Send + Sync;

/// A tool backed by a closure. Counts its invocations.
pub struct FnTool {
    name: String,
    description: String,
    func: Arc<ToolFn>,
    calls: Arc<AtomicUsize>,
}

impl FnTool {
    pub fn new(
        name: &str,
        func: impl Fn(serde_json::Value) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: format!("Test tool {}", name),
            func: Arc::new(func),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A tool that always returns `output`.
    pub fn constant(name: &str, output: &str) -> Self {
        let output = output.to_string();
        Self::new(name, move |_| Ok(output.clone()))
    }

    /// A tool that always fails with a `ToolExecution` error.
    pub fn failing(name: &str, message: &str) -> Self {
        let tool = name.to_string();
        let message = message.to_string();
        Self::new(name, move |_| {
            Err(StrandError::ToolExecution {
                tool: tool.clone(),
                message: message.clone(),
            })
        })
    }

    /// Shared invocation counter; clone before registering the tool.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.func)(input);
        Box::pin(async move { result.map(ToolResult::success) })
    }
}

/// A retriever that returns fixed chunks, truncated to `top_k`.
pub struct StaticRetriever {
    chunks: Vec<RetrievedChunk>,
    queries: std::sync::Mutex<Vec<RetrievalQuery>>,
}

impl StaticRetriever {
    pub fn new(contents: &[&str]) -> Self {
        let chunks = contents
            .iter()
            .enumerate()
            .map(|(i, c)| RetrievedChunk {
                content: c.to_string(),
                score: 1.0 - i as f64 * 0.1,
                metadata: serde_json::json!({"rank": i}),
            })
            .collect();
        Self {
            chunks,
            queries: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<RetrievalQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl Retriever for StaticRetriever {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>> {
        let top_k = query.top_k;
        self.queries.lock().unwrap().push(query);
        let chunks = self.chunks.iter().take(top_k).cloned().collect();
        Box::pin(async move { Ok(chunks) })
    }
}

/// A retriever whose backend is always down.
pub struct FailingRetriever;

impl Retriever for FailingRetriever {
    fn retrieve(&self, _query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>> {
        Box::pin(async { Err(StrandError::Http("vector store unavailable".into())) })
    }
}
