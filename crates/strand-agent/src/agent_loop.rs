use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::config::{McpServerConfig, ModelConfig};
use strand_core::error::{Result, StrandError};
use strand_core::traits::{LlmClient, Retriever};
use strand_core::types::*;
use strand_mcp::McpSession;
use strand_tools::ToolRegistry;

use crate::event::{AgentEvent, ToolCall, ToolRecord};
use crate::knowledge::{self, KnowledgeSettings, NO_KNOWLEDGE_MESSAGE};

/// Answer used when the loop runs out of iterations.
pub const ITERATION_LIMIT_MESSAGE: &str =
    "Reached the maximum number of reasoning iterations without a final answer.";

/// Error content reported when the loop is cancelled.
const CANCELLED: &str = "cancelled";

/// Accumulator for streaming tool call fragments.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Input for one agent loop invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub model: ModelConfig,
    pub system_prompt: Option<String>,
    /// Conversation so far, ending with the user's message.
    pub messages: Vec<ChatMessage>,
    /// Local tools to bind. Empty binds every registered tool.
    pub enabled_tools: Vec<String>,
    /// Configured MCP servers to connect for this invocation.
    pub mcp_servers: Vec<String>,
    pub max_iterations: usize,
    pub knowledge: Option<KnowledgeSettings>,
}

impl AgentRequest {
    pub fn new(model: ModelConfig, user_message: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            model,
            system_prompt: None,
            messages: vec![ChatMessage::user(user_message)],
            enabled_tools: Vec::new(),
            mcp_servers: Vec::new(),
            max_iterations: 8,
            knowledge: None,
        }
    }
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTerminal {
    Done,
    IterationLimit,
    Error(String),
}

/// Summary of a finished loop.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub answer: String,
    pub tool_results: Vec<ToolRecord>,
    /// Number of model calls made.
    pub iterations: usize,
    pub terminal: AgentTerminal,
}

impl AgentOutcome {
    fn new() -> Self {
        Self {
            answer: String::new(),
            tool_results: Vec::new(),
            iterations: 0,
            terminal: AgentTerminal::Done,
        }
    }
}

/// The streaming think / dispatch / observe loop.
///
/// Holds only shared, read-only services; each [`AgentLoop::run`] owns its
/// own history and MCP session.
pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    mcp_servers: HashMap<String, McpServerConfig>,
    retriever: Option<Arc<dyn Retriever>>,
    cancel: Option<CancellationToken>,
}

impl AgentLoop {
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry) -> Self {
        Self {
            llm,
            tools,
            mcp_servers: HashMap::new(),
            retriever: None,
            cancel: None,
        }
    }

    pub fn with_mcp_servers(mut self, servers: HashMap<String, McpServerConfig>) -> Self {
        self.mcp_servers = servers;
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Run the loop in a background task and stream the caller-facing events.
    pub fn stream(self: Arc<Self>, request: AgentRequest) -> impl futures::Stream<Item = AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.run(request, &tx).await;
        });
        UnboundedReceiverStream::new(rx).filter(|e| futures::future::ready(e.is_forwarded()))
    }

    /// Run the loop to completion, pushing events on `sink`.
    ///
    /// Always ends with exactly one `done` or `error` event; failures are
    /// reported there and in [`AgentOutcome::terminal`], never as `Err`.
    pub async fn run(&self, request: AgentRequest, sink: &mpsc::UnboundedSender<AgentEvent>) -> AgentOutcome {
        let emit = |event: AgentEvent| {
            // A closed receiver means the caller stopped listening; keep going.
            let _ = sink.send(event);
        };

        let session = if request.mcp_servers.is_empty() {
            None
        } else {
            Some(McpSession::open(&self.mcp_servers, &request.mcp_servers).await)
        };

        let outcome = self.drive(&request, session.as_ref(), &emit).await;

        if let Some(session) = session {
            session.close().await;
        }

        match &outcome.terminal {
            AgentTerminal::Error(message) => emit(AgentEvent::Error {
                content: message.clone(),
            }),
            _ => emit(AgentEvent::Done),
        }
        outcome
    }

    async fn drive(
        &self,
        request: &AgentRequest,
        session: Option<&Arc<McpSession>>,
        emit: &impl Fn(AgentEvent),
    ) -> AgentOutcome {
        let mut outcome = AgentOutcome::new();

        if self.is_cancelled() {
            outcome.terminal = AgentTerminal::Error(CANCELLED.to_string());
            return outcome;
        }

        // Knowledge augmentation
        let mut system_prompt = request.system_prompt.clone().unwrap_or_default();
        if let Some(settings) = request.knowledge.as_ref().filter(|k| !k.knowledge_base_ids.is_empty()) {
            match &self.retriever {
                Some(retriever) => {
                    let references =
                        knowledge::retrieve_references(retriever.as_ref(), settings, &request.messages).await;
                    if !references.is_empty() {
                        system_prompt = knowledge::augment_system_prompt(&system_prompt, &references);
                    } else if !settings.fallback_to_model {
                        info!("No knowledge found and model fallback disabled");
                        emit(AgentEvent::Text {
                            content: NO_KNOWLEDGE_MESSAGE.to_string(),
                        });
                        outcome.answer = NO_KNOWLEDGE_MESSAGE.to_string();
                        return outcome;
                    }
                }
                None => warn!("Knowledge bases requested but no retriever is configured"),
            }
        }

        let mut registry = self.tools.subset(&request.enabled_tools);
        if let Some(session) = session {
            registry = registry.extended(session.tools().await);
        }
        let tool_defs = registry.definitions();

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend(request.messages.iter().cloned());

        let tool_ctx = ToolContext::new(request.run_id.clone());

        for iteration in 0..request.max_iterations {
            if self.is_cancelled() {
                outcome.terminal = AgentTerminal::Error(CANCELLED.to_string());
                return outcome;
            }

            debug!(iteration, "Starting agent iteration");
            outcome.iterations += 1;

            let (text, tool_calls) = match self.think(request, &messages, &tool_defs, iteration, emit).await {
                Ok(turn) => turn,
                Err(StrandError::Cancelled) => {
                    info!("Agent run cancelled");
                    outcome.terminal = AgentTerminal::Error(CANCELLED.to_string());
                    return outcome;
                }
                Err(e) => {
                    error!(error = %e, "Agent model call failed");
                    outcome.terminal = AgentTerminal::Error(e.to_string());
                    return outcome;
                }
            };

            emit(AgentEvent::Message {
                role: "assistant".to_string(),
                content: text.clone(),
                tool_calls: tool_calls.clone(),
                name: None,
                tool_call_id: None,
            });
            messages.push(assistant_message(&text, &tool_calls));
            outcome.answer = text;

            if tool_calls.is_empty() {
                info!(iterations = outcome.iterations, "Agent run complete");
                return outcome;
            }

            for call in tool_calls {
                let tool = registry.get(&call.name);
                emit(AgentEvent::Trace {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                    mcp_server: tool
                        .as_ref()
                        .and_then(|t| t.remote_server().map(str::to_string)),
                });

                let (result, is_error) = match tool {
                    None => (format!("Tool '{}' not found", call.name), true),
                    Some(_) => dispatch(&registry, &call, tool_ctx.clone()).await,
                };

                emit(AgentEvent::TraceResult {
                    id: call.id.clone(),
                    result: result.clone(),
                });
                messages.push(ChatMessage::tool_result(&call.id, &result, is_error));
                emit(AgentEvent::Message {
                    role: "tool".to_string(),
                    content: result.clone(),
                    tool_calls: Vec::new(),
                    name: Some(call.name.clone()),
                    tool_call_id: Some(call.id.clone()),
                });
                outcome.tool_results.push(ToolRecord {
                    name: call.name,
                    args: call.args,
                    result,
                });
            }
        }

        warn!(max_iterations = request.max_iterations, "Agent hit iteration limit");
        emit(AgentEvent::Text {
            content: ITERATION_LIMIT_MESSAGE.to_string(),
        });
        outcome.answer = ITERATION_LIMIT_MESSAGE.to_string();
        outcome.terminal = AgentTerminal::IterationLimit;
        outcome
    }

    /// One model call: stream text out as it arrives and assemble tool calls.
    async fn think(
        &self,
        request: &AgentRequest,
        messages: &[ChatMessage],
        tool_defs: &[ToolDefinition],
        iteration: usize,
        emit: &impl Fn(AgentEvent),
    ) -> Result<(String, Vec<ToolCall>)> {
        let stream_result = tokio::select! {
            result = self.llm.chat_stream(&request.model, messages.to_vec(), tool_defs) => result,
            _ = self.cancelled() => return Err(StrandError::Cancelled),
        };
        let mut stream = stream_result?;

        let mut text = String::new();
        let mut fragments: BTreeMap<usize, ToolCallAccumulator> = BTreeMap::new();

        loop {
            let delta = tokio::select! {
                delta = stream.next() => delta,
                _ = self.cancelled() => return Err(StrandError::Cancelled),
            };
            let Some(delta) = delta else { break };

            match delta? {
                StreamDelta::TextDelta(chunk) => {
                    emit(AgentEvent::Text {
                        content: chunk.clone(),
                    });
                    text.push_str(&chunk);
                }
                StreamDelta::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let acc = fragments.entry(index).or_default();
                    if let Some(id) = id {
                        acc.id.push_str(&id);
                    }
                    if let Some(name) = name {
                        acc.name.push_str(&name);
                    }
                    if let Some(arguments) = arguments {
                        acc.arguments.push_str(&arguments);
                    }
                }
                StreamDelta::Stop(reason) => {
                    debug!(?reason, "Model stopped");
                }
                StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    debug!(input_tokens, output_tokens, "Model usage");
                }
            }
        }

        let tool_calls = fragments
            .into_iter()
            .filter(|(_, acc)| !acc.name.is_empty())
            .map(|(index, acc)| ToolCall {
                id: if acc.id.is_empty() {
                    format!("call_{}_{}", iteration, index)
                } else {
                    acc.id
                },
                name: acc.name,
                args: parse_arguments(&acc.arguments),
            })
            .collect();

        Ok((text, tool_calls))
    }
}

/// Parse accumulated argument text. Anything but a JSON object becomes `{}`.
fn parse_arguments(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            if !raw.trim().is_empty() {
                warn!(arguments = %raw, "Malformed tool arguments, using an empty object");
            }
            serde_json::json!({})
        }
    }
}

/// Run one tool and coerce the outcome into the string fed back to the model.
async fn dispatch(registry: &ToolRegistry, call: &ToolCall, ctx: ToolContext) -> (String, bool) {
    match registry.execute(&call.name, call.args.clone(), ctx).await {
        Ok(result) => (result.content, result.is_error),
        Err(e) => {
            warn!(tool = %call.name, error = %e, "Tool execution failed");
            (format!("Tool '{}' failed: {}", call.name, e), true)
        }
    }
}

fn assistant_message(text: &str, tool_calls: &[ToolCall]) -> ChatMessage {
    let mut content = Vec::with_capacity(tool_calls.len() + 1);
    if !text.is_empty() {
        content.push(ContentBlock::Text { text: text.to_string() });
    }
    for call in tool_calls {
        content.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.args.clone(),
        });
    }
    let mut message = ChatMessage::assistant_text(text);
    message.content = content;
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_test_utils::{FnTool, ScriptedLlm, ScriptedTurn, StaticRetriever};

    fn model() -> ModelConfig {
        ModelConfig::new("test-model")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Event names of forwarded, non-text events.
    fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Trace { .. } => Some("trace"),
                AgentEvent::TraceResult { .. } => Some("trace_result"),
                AgentEvent::Done => Some("done"),
                AgentEvent::Error { .. } => Some("error"),
                _ => None,
            })
            .collect()
    }

    fn streamed_text(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn run(agent: &AgentLoop, request: AgentRequest) -> (AgentOutcome, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = agent.run(request, &tx).await;
        (outcome, drain(&mut rx))
    }

    #[tokio::test]
    async fn test_calculator_scenario() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ScriptedTurn::tool_call("call_1", "calc", serde_json::json!({"expression": "2+2"})),
            ScriptedTurn::text("4"),
        ]));
        let agent = AgentLoop::new(llm.clone(), ToolRegistry::with_builtins());

        let mut request = AgentRequest::new(model(), "what is 2+2");
        request.system_prompt = Some("You are a calculator".into());
        request.enabled_tools = vec!["calc".into()];

        let (outcome, events) = run(&agent, request).await;

        assert_eq!(kinds(&events), vec!["trace", "trace_result", "done"]);
        assert_eq!(
            events.iter().find(|e| matches!(e, AgentEvent::TraceResult { .. })),
            Some(&AgentEvent::TraceResult {
                id: "call_1".into(),
                result: "4".into()
            })
        );
        assert_eq!(outcome.answer, "4");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.terminal, AgentTerminal::Done);
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].args["expression"], "2+2");
        assert_eq!(llm.call_count(), 2);

        // Only the enabled tool is bound, and the second call sees the tool result.
        assert_eq!(llm.bound_tools()[0], vec!["calc".to_string()]);
        let second = &llm.requests()[1];
        assert_eq!(second[0].role, Role::System);
        let last = second.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert!(matches!(
            &last.content[0],
            ContentBlock::ToolResult { tool_use_id, content, .. } if tool_use_id == "call_1" && content == "4"
        ));
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let llm = Arc::new(ScriptedLlm::repeating(ScriptedTurn::tool_call(
            "",
            "echo",
            serde_json::json!({"text": "again"}),
        )));
        let agent = AgentLoop::new(llm.clone(), ToolRegistry::with_builtins());
        let mut request = AgentRequest::new(model(), "loop forever");
        request.max_iterations = 1;

        let (outcome, events) = run(&agent, request).await;

        assert_eq!(kinds(&events), vec!["trace", "trace_result", "done"]);
        assert_eq!(streamed_text(&events), ITERATION_LIMIT_MESSAGE);
        assert_eq!(outcome.terminal, AgentTerminal::IterationLimit);
        assert_eq!(outcome.answer, ITERATION_LIMIT_MESSAGE);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_call_id_is_generated() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ScriptedTurn::tool_call("", "echo", serde_json::json!({"text": "hi"})),
            ScriptedTurn::text("done"),
        ]));
        let agent = AgentLoop::new(llm, ToolRegistry::with_builtins());

        let (_, events) = run(&agent, AgentRequest::new(model(), "say hi")).await;

        let trace_ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Trace { id, .. } | AgentEvent::TraceResult { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(trace_ids, vec!["call_0_0", "call_0_0"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_tool_failure_are_fed_back() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            ScriptedTurn::tool_calls(vec![
                ("a", "nope", serde_json::json!({})),
                ("b", "boom", serde_json::json!({})),
            ]),
            ScriptedTurn::text("recovered"),
        ]));
        let tools = ToolRegistry::builder()
            .register(FnTool::failing("boom", "kaput"))
            .build();
        let agent = AgentLoop::new(llm.clone(), tools);

        let (outcome, events) = run(&agent, AgentRequest::new(model(), "try tools")).await;

        let results: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TraceResult { result, .. } => Some(result.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(results[0], "Tool 'nope' not found");
        assert!(results[1].contains("kaput"));
        assert_eq!(outcome.answer, "recovered");
        assert_eq!(outcome.terminal, AgentTerminal::Done);
    }

    #[tokio::test]
    async fn test_fragmented_and_malformed_arguments() {
        let turn = ScriptedTurn::Deltas(vec![
            StreamDelta::ToolCallDelta {
                index: 0,
                id: Some("c".into()),
                name: Some("ec".into()),
                arguments: Some("{\"text\"".into()),
            },
            StreamDelta::ToolCallDelta {
                index: 0,
                id: Some("1".into()),
                name: Some("ho".into()),
                arguments: Some(": \"joined\"}".into()),
            },
            StreamDelta::ToolCallDelta {
                index: 1,
                id: Some("c2".into()),
                name: Some("echo".into()),
                arguments: Some("{not json".into()),
            },
            StreamDelta::Stop(StopReason::ToolUse),
        ]);
        let llm = Arc::new(ScriptedLlm::new(vec![turn, ScriptedTurn::text("ok")]));
        let agent = AgentLoop::new(llm, ToolRegistry::with_builtins());

        let (outcome, events) = run(&agent, AgentRequest::new(model(), "go")).await;

        let traces: Vec<(String, String, serde_json::Value)> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Trace { id, name, args, .. } => Some((id.clone(), name.clone(), args.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(traces[0], ("c1".into(), "echo".into(), serde_json::json!({"text": "joined"})));
        assert_eq!(traces[1], ("c2".into(), "echo".into(), serde_json::json!({})));
        assert_eq!(outcome.tool_results[0].result, "joined");
    }

    #[tokio::test]
    async fn test_model_failure_ends_with_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedTurn::fail("provider down")]));
        let agent = AgentLoop::new(llm, ToolRegistry::new());

        let (outcome, events) = run(&agent, AgentRequest::new(model(), "hello")).await;

        assert!(matches!(events.last(), Some(AgentEvent::Error { content }) if content.contains("provider down")));
        assert!(matches!(outcome.terminal, AgentTerminal::Error(_)));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedTurn::text("never")]));
        let token = CancellationToken::new();
        token.cancel();
        let agent = AgentLoop::new(llm.clone(), ToolRegistry::new()).with_cancel(token);

        let (outcome, events) = run(&agent, AgentRequest::new(model(), "hello")).await;

        assert_eq!(events, vec![AgentEvent::Error { content: "cancelled".into() }]);
        assert_eq!(outcome.terminal, AgentTerminal::Error("cancelled".into()));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_knowledge_without_fallback_skips_model() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let agent = AgentLoop::new(llm.clone(), ToolRegistry::new())
            .with_retriever(Arc::new(StaticRetriever::new(&[])));
        let mut request = AgentRequest::new(model(), "anything?");
        request.knowledge = Some(KnowledgeSettings {
            fallback_to_model: false,
            ..KnowledgeSettings::new(vec!["kb".into()])
        });

        let (outcome, events) = run(&agent, request).await;

        assert_eq!(streamed_text(&events), NO_KNOWLEDGE_MESSAGE);
        assert_eq!(events.last(), Some(&AgentEvent::Done));
        assert_eq!(outcome.answer, NO_KNOWLEDGE_MESSAGE);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_knowledge_references_reach_system_prompt() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedTurn::text("answer")]));
        let agent = AgentLoop::new(llm.clone(), ToolRegistry::new())
            .with_retriever(Arc::new(StaticRetriever::new(&["Strand runs graphs."])));
        let mut request = AgentRequest::new(model(), "what does strand do?");
        request.system_prompt = Some("Be brief.".into());
        request.knowledge = Some(KnowledgeSettings::new(vec!["kb".into()]));

        run(&agent, request).await;

        let system = llm.requests()[0][0].text();
        assert!(system.starts_with("Be brief."));
        assert!(system.contains("[1] Strand runs graphs."));
    }

    #[tokio::test]
    async fn test_stream_hides_message_events() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedTurn::text("hello there")]));
        let agent = Arc::new(AgentLoop::new(llm, ToolRegistry::new()));

        let events: Vec<AgentEvent> = agent
            .stream(AgentRequest::new(model(), "hi"))
            .collect()
            .await;

        assert!(events.iter().all(|e| e.is_forwarded()));
        assert_eq!(streamed_text(&events), "hello there");
        assert_eq!(events.last(), Some(&AgentEvent::Done));
    }
}
