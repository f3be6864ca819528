use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::LlmClient;
use strand_core::types::{ChatMessage, StopReason, StreamDelta, ToolDefinition};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these deltas.
    Deltas(Vec<StreamDelta>),
    /// Fail request setup with `LlmRequest(message)`.
    Fail(String),
    /// Stream these deltas, then fail with `LlmStream(message)`.
    BreakAfter(Vec<StreamDelta>, String),
}

impl ScriptedTurn {
    /// A plain text answer, delivered in two fragments.
    pub fn text(text: &str) -> Self {
        let mid = split_point(text);
        let mut deltas = Vec::new();
        if mid > 0 {
            deltas.push(StreamDelta::TextDelta(text[..mid].to_string()));
        }
        deltas.push(StreamDelta::TextDelta(text[mid..].to_string()));
        deltas.push(StreamDelta::Stop(StopReason::EndTurn));
        Self::Deltas(deltas)
    }

    /// A single tool call whose arguments arrive split across two deltas.
    pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> Self {
        Self::tool_calls(vec![(id, name, args)])
    }

    /// Several tool calls in one response, interleaved by index.
    pub fn tool_calls(calls: Vec<(&str, &str, serde_json::Value)>) -> Self {
        let mut heads = Vec::new();
        let mut tails = Vec::new();
        for (index, (id, name, args)) in calls.into_iter().enumerate() {
            let args = args.to_string();
            let mid = split_point(&args);
            heads.push(StreamDelta::ToolCallDelta {
                index,
                id: if id.is_empty() { None } else { Some(id.to_string()) },
                name: Some(name.to_string()),
                arguments: Some(args[..mid].to_string()),
            });
            tails.push(StreamDelta::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments: Some(args[mid..].to_string()),
            });
        }
        let mut deltas = heads;
        deltas.extend(tails);
        deltas.push(StreamDelta::Stop(StopReason::ToolUse));
        Self::Deltas(deltas)
    }

    pub fn fail(message: &str) -> Self {
        Self::Fail(message.to_string())
    }
}

fn split_point(s: &str) -> usize {
    (0..=s.len() / 2)
        .rev()
        .find(|i| s.is_char_boundary(*i))
        .unwrap_or(0)
}

/// An `LlmClient` that replays scripted turns in order.
///
/// When the script runs out, the `repeat` turn (if any) is served forever;
/// otherwise requests fail.
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    repeat: Option<ScriptedTurn>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    tool_names: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            tool_names: Mutex::new(Vec::new()),
        }
    }

    /// Serve the same turn for every request.
    pub fn repeating(turn: ScriptedTurn) -> Self {
        let mut llm = Self::new(Vec::new());
        llm.repeat = Some(turn);
        llm
    }

    /// Number of `chat_stream` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists received, one entry per call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// Tool names bound on each call.
    pub fn bound_tools(&self) -> Vec<Vec<String>> {
        self.tool_names.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages);
        self.tool_names
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        let next = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone());

        Box::pin(async move {
            let items: Vec<Result<StreamDelta>> = match next {
                Some(ScriptedTurn::Deltas(deltas)) => deltas.into_iter().map(Ok).collect(),
                Some(ScriptedTurn::BreakAfter(deltas, message)) => {
                    let mut items: Vec<Result<StreamDelta>> = deltas.into_iter().map(Ok).collect();
                    items.push(Err(StrandError::LlmStream(message)));
                    items
                }
                Some(ScriptedTurn::Fail(message)) => return Err(StrandError::LlmRequest(message)),
                None => return Err(StrandError::LlmRequest("script exhausted".into())),
            };
            Ok(Box::pin(futures::stream::iter(items)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}
