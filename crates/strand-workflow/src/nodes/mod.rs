mod agent;
mod assign;
mod classifier;
mod code;
mod condition;
mod document;
mod extractor;
mod http;
mod knowledge;
mod list;
mod llm;
mod start;
mod template;
mod terminal;
mod tool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use strand_core::config::{EngineConfig, McpServerConfig, ModelConfig};
use strand_core::error::Result;
use strand_core::traits::{LlmClient, Retriever};
use strand_core::types::{ChatMessage, RunId, StreamDelta};
use strand_tools::ToolRegistry;

use crate::event::{EventSink, WorkflowEvent};
use crate::graph::config::{ModelOverride, NodeConfig};
use crate::graph::{Node, WorkflowGraph};
use crate::sandbox::{self, CodeSandbox, ProcessSandbox};
use crate::state::{ExecutionState, StateEffect};

pub use list::apply_operation;

/// Shared, read-only collaborators handed to every executor.
#[derive(Clone)]
pub struct NodeServices {
    pub llm: Arc<dyn LlmClient>,
    /// Default model; nodes may override parts of it.
    pub model: ModelConfig,
    pub tools: ToolRegistry,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub http: reqwest::Client,
    pub http_timeout: Duration,
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl NodeServices {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self {
            llm,
            model,
            tools: ToolRegistry::new(),
            retriever: None,
            sandbox: Arc::new(ProcessSandbox::default()),
            http: reqwest::Client::new(),
            http_timeout: Duration::from_secs(30),
            mcp_servers: HashMap::new(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_mcp_servers(mut self, servers: HashMap<String, McpServerConfig>) -> Self {
        self.mcp_servers = servers;
        self
    }

    /// Apply the `[engine]` sandbox and HTTP settings.
    pub fn with_engine(mut self, engine: &EngineConfig) -> Self {
        self.sandbox = sandbox::from_config(&engine.code);
        self.http_timeout = Duration::from_secs(engine.http.timeout_secs);
        self
    }

    pub(crate) fn model_for(&self, model: Option<&ModelOverride>) -> ModelConfig {
        match model {
            Some(o) => o.apply(&self.model),
            None => self.model.clone(),
        }
    }
}

impl std::fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServices")
            .field("model", &self.model.model_id)
            .field("tools", &self.tools.list())
            .field("retriever", &self.retriever.is_some())
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything an executor may look at besides the state.
pub struct NodeContext<'a> {
    pub node: &'a Node,
    pub graph: &'a WorkflowGraph,
    pub services: &'a NodeServices,
    pub run_id: &'a RunId,
    pub cancel: Option<&'a CancellationToken>,
    events: &'a EventSink,
}

impl<'a> NodeContext<'a> {
    pub fn new(
        node: &'a Node,
        graph: &'a WorkflowGraph,
        services: &'a NodeServices,
        run_id: &'a RunId,
        events: &'a EventSink,
    ) -> Self {
        Self {
            node,
            graph,
            services,
            run_id,
            cancel: None,
            events,
        }
    }

    pub fn with_cancel(mut self, cancel: Option<&'a CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Push a progress chunk for this node.
    pub fn emit_chunk(&self, chunk: impl Into<String>) {
        // A closed receiver means nobody is listening any more; keep running.
        let _ = self.events.send(WorkflowEvent::NodeOutput {
            node_id: self.node.id.clone(),
            chunk: chunk.into(),
        });
    }
}

/// What one successful node attempt produced.
///
/// Executors never write state directly: the runner applies `effects` once the
/// attempt has succeeded, so a retry starts from the same state.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub output: Value,
    pub effects: Vec<StateEffect>,
}

impl NodeOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: StateEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Run the executor matching the node's config.
pub async fn execute(ctx: &NodeContext<'_>, state: &ExecutionState) -> Result<NodeOutcome> {
    match &ctx.node.config {
        NodeConfig::Start(c) => Ok(start::execute(c, state)),
        NodeConfig::Llm(c) => llm::execute(ctx, c, state).await,
        NodeConfig::Condition(c) => Ok(condition::execute(c, state)),
        NodeConfig::Code(c) => code::execute(ctx, c, state).await,
        NodeConfig::Http(c) => http::execute(ctx, c, state).await,
        NodeConfig::Assign(c) => Ok(assign::execute(c, state)),
        NodeConfig::Knowledge(c) => Ok(knowledge::execute(ctx, c, state).await),
        NodeConfig::Iteration(c) => Ok(list::execute_iteration(ctx, c, state)),
        NodeConfig::Tool(c) => tool::execute(ctx, c, state).await,
        NodeConfig::Classifier(c) => classifier::execute(ctx, c, state).await,
        NodeConfig::Document(c) => Ok(document::execute(c, state).await),
        NodeConfig::ListOperator(c) => Ok(list::execute_list_operator(c, state)),
        NodeConfig::Template(c) => Ok(template::execute(c, state)),
        NodeConfig::Extractor(c) => extractor::execute(ctx, c, state).await,
        NodeConfig::Agent(c) => agent::execute(ctx, c, state).await,
        NodeConfig::Answer(c) => Ok(terminal::execute_answer(ctx, c, state)),
        NodeConfig::End(c) => Ok(terminal::execute_end(ctx, c, state)),
    }
}

/// Stream one model completion without tools, optionally forwarding the
/// text deltas as progress chunks.
pub(crate) async fn complete(
    ctx: &NodeContext<'_>,
    model: &ModelConfig,
    messages: Vec<ChatMessage>,
    forward: bool,
) -> Result<String> {
    let mut stream = ctx.services.llm.chat_stream(model, messages, &[]).await?;
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        if let StreamDelta::TextDelta(chunk) = delta? {
            if forward && !chunk.is_empty() {
                ctx.emit_chunk(chunk.as_str());
            }
            text.push_str(&chunk);
        }
    }
    Ok(text)
}
