use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::config::EngineConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::{NoopRecorder, RunRecorder};
use strand_core::types::{system_keys, NodeRecord, RunId, RunRecord, RunStatus};

use crate::controller::{run_parallel, with_retry, RetryPolicy};
use crate::event::{EventSink, WorkflowEvent};
use crate::graph::{branch_signal, Node, RunMode, WorkflowGraph};
use crate::nodes::{self, NodeContext, NodeOutcome, NodeServices};
use crate::state::{ExecutionState, WORKFLOW_OUTPUT_KEY};

/// One user turn of a conversational run.
#[derive(Debug, Clone, Default)]
pub struct ConversationTurn {
    pub query: String,
    /// Empty means "start a new conversation".
    pub conversation_id: String,
    pub inputs: Map<String, Value>,
    /// Carried over from the previous turn's [`RunReport`].
    pub variables: Map<String, Value>,
    pub conversation_variables: Map<String, Value>,
    pub dialogue_count: u64,
}

impl ConversationTurn {
    pub fn new(query: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: conversation_id.into(),
            ..Self::default()
        }
    }

    /// The next turn of the same conversation, carrying its variables.
    pub fn follow_up(report: &RunReport, query: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: conversation_id.into(),
            inputs: Map::new(),
            variables: report.variables.clone(),
            conversation_variables: report.conversation_variables.clone(),
            dialogue_count: report.dialogue_count + 1,
        }
    }
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    /// What `workflow_finished` carried; `None` unless the run succeeded.
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub variables: Map<String, Value>,
    pub conversation_variables: Map<String, Value>,
    pub dialogue_count: u64,
    /// Every node output written, including those of a failed run.
    pub node_outputs: Map<String, Value>,
    pub elapsed: Duration,
    pub failure: Option<StrandError>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// The reply of a conversational run.
    pub fn answer(&self) -> Option<&str> {
        self.outputs.as_ref()?.get("answer")?.as_str()
    }

    /// The outputs, or the error that ended the run.
    pub fn into_result(self) -> Result<Value> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.outputs.unwrap_or(Value::Null)),
        }
    }
}

/// Walks a [`WorkflowGraph`] from its start node.
///
/// Ready nodes are taken from a FIFO queue and each node runs at most once.
/// After a node runs, its own output decides which outgoing edges are
/// followed. The walk ends when the queue is empty or the terminal node of
/// the run mode has executed.
pub struct WorkflowRunner {
    graph: Arc<WorkflowGraph>,
    services: Arc<NodeServices>,
    engine: EngineConfig,
    recorder: Arc<dyn RunRecorder>,
    cancel: Option<CancellationToken>,
    run_id: RunId,
    system: Map<String, Value>,
}

impl WorkflowRunner {
    pub fn new(graph: Arc<WorkflowGraph>, services: Arc<NodeServices>) -> Self {
        Self {
            graph,
            services,
            engine: EngineConfig::default(),
            recorder: Arc::new(NoopRecorder),
            cancel: None,
            run_id: RunId::new(),
            system: Map::new(),
        }
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Set an identity system variable such as `user_id` or `app_id`.
    pub fn with_system_variable(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.system.insert(key.to_string(), value.into());
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Run in batch mode: the `end` node collects the result.
    pub async fn run_batch(self, inputs: Map<String, Value>, sink: &EventSink) -> RunReport {
        let state = ExecutionState::new(inputs);
        self.execute(RunMode::Batch, state, sink).await
    }

    /// Run one conversational turn: the `answer` node streams the reply.
    pub async fn run_conversation(self, turn: ConversationTurn, sink: &EventSink) -> RunReport {
        let conversation_id = if turn.conversation_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            turn.conversation_id
        };

        let mut inputs = turn.inputs;
        inputs.insert(system_keys::QUERY.into(), json!(turn.query));
        let mut state = ExecutionState::new(inputs);
        state.variables = turn.variables;
        state.conversation_variables = turn.conversation_variables;
        state.system_variables.insert(system_keys::QUERY.into(), json!(turn.query));
        state
            .system_variables
            .insert(system_keys::CONVERSATION_ID.into(), json!(conversation_id));
        state
            .system_variables
            .insert(system_keys::DIALOGUE_COUNT.into(), json!(turn.dialogue_count));

        self.execute(RunMode::Conversational, state, sink).await
    }

    async fn execute(self, mode: RunMode, mut state: ExecutionState, sink: &EventSink) -> RunReport {
        let started = Instant::now();
        for (key, value) in &self.system {
            state.system_variables.entry(key.clone()).or_insert_with(|| value.clone());
        }
        state
            .system_variables
            .insert(system_keys::WORKFLOW_RUN_ID.into(), json!(self.run_id.0));
        if let Some(files) = state.inputs.get(system_keys::FILES).cloned() {
            state.system_variables.entry(system_keys::FILES.to_string()).or_insert(files);
        }

        info!(run_id = %self.run_id, mode = mode.as_str(), nodes = self.graph.len(), "Workflow started");
        emit(
            sink,
            WorkflowEvent::WorkflowStarted {
                workflow_run_id: self.run_id.0.clone(),
                inputs: Value::Object(state.inputs.clone()),
            },
        );
        self.record_run(mode, RunStatus::Running, &state, None, None, None).await;

        let checked = self
            .graph
            .check_mode(mode)
            .and_then(|()| self.graph.check_tools(&self.services.tools));
        let result = match checked {
            Ok(()) => self.walk(mode, &mut state, sink).await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        let (status, outputs, failure) = match result {
            Ok(()) => (RunStatus::Succeeded, Some(final_outputs(mode, &state)), None),
            Err(StrandError::Cancelled) => (RunStatus::Stopped, None, Some(StrandError::Cancelled)),
            Err(e) => (RunStatus::Failed, None, Some(e)),
        };
        let error = failure.as_ref().map(|e| e.to_string());

        match &error {
            None => info!(run_id = %self.run_id, elapsed_ms = elapsed.as_millis() as u64, "Workflow succeeded"),
            Some(message) => warn!(run_id = %self.run_id, status = status.as_str(), error = %message, "Workflow did not succeed"),
        }
        emit(
            sink,
            WorkflowEvent::WorkflowFinished {
                status,
                outputs: outputs.clone(),
                error: error.clone(),
                elapsed_time: elapsed.as_secs_f64(),
            },
        );
        self.record_run(mode, status, &state, outputs.clone(), error.clone(), Some(elapsed))
            .await;

        let dialogue_count = state
            .system_variables
            .get(system_keys::DIALOGUE_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        RunReport {
            run_id: self.run_id,
            status,
            outputs,
            error,
            node_outputs: state.outputs_map(),
            variables: state.variables,
            conversation_variables: state.conversation_variables,
            dialogue_count,
            elapsed,
            failure,
        }
    }

    async fn walk(&self, mode: RunMode, state: &mut ExecutionState, sink: &EventSink) -> Result<()> {
        let terminal = mode.terminal();
        let mut queue = VecDeque::from([self.graph.start_node().id.clone()]);
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if self.is_cancelled() {
                info!(run_id = %self.run_id, "Workflow cancelled");
                return Err(StrandError::Cancelled);
            }
            if visited.contains(&id) {
                continue;
            }
            let node = self
                .graph
                .node(&id)
                .ok_or_else(|| StrandError::Graph(format!("node '{}' not found", id)))?;
            visited.insert(id.clone());

            let outcome = self.run_node(node, state, sink).await?;
            commit(state, &id, outcome);

            if node.kind == terminal {
                debug!(node_id = %id, "Terminal node reached");
                break;
            }

            let targets = self.next_targets(&id, state);
            let fan_out = self.engine.parallel_branches
                && targets.len() >= 2
                && targets.iter().all(|t| {
                    !visited.contains(t) && self.graph.node(t).is_some_and(|n| n.kind != terminal)
                });

            if fan_out {
                self.run_branches(&targets, state, sink).await?;
                for branch in &targets {
                    visited.insert(branch.clone());
                }
                for branch in &targets {
                    queue.extend(self.next_targets(branch, state));
                }
            } else {
                queue.extend(targets);
            }
        }
        Ok(())
    }

    fn next_targets(&self, id: &str, state: &ExecutionState) -> Vec<String> {
        let signal = state.output(id).and_then(branch_signal);
        self.graph.next_targets(id, signal.as_deref())
    }

    /// Run sibling branches concurrently against the same state, then commit
    /// every successful output. Fails with the first branch error once all
    /// branches have reported.
    async fn run_branches(&self, ids: &[String], state: &mut ExecutionState, sink: &EventSink) -> Result<()> {
        debug!(branches = ids.len(), "Running branches in parallel");
        let snapshot: &ExecutionState = state;
        let tasks: Vec<(String, BoxFuture<'_, Result<NodeOutcome>>)> = ids
            .iter()
            .filter_map(|id| self.graph.node(id))
            .map(|node| {
                let task: BoxFuture<'_, Result<NodeOutcome>> = Box::pin(self.run_node(node, snapshot, sink));
                (node.id.clone(), task)
            })
            .collect();
        let reports = run_parallel(tasks, self.engine.max_concurrency).await;

        let mut first_error = None;
        for report in reports {
            match report.outcome {
                Ok(outcome) => commit(state, &report.node_id, outcome),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Execute one node under its retry policy, bracketed by
    /// `node_started` / `node_finished`.
    async fn run_node(&self, node: &Node, state: &ExecutionState, sink: &EventSink) -> Result<NodeOutcome> {
        let node_type = node.kind.as_str();
        info!(node_id = %node.id, node_type, "Executing node");
        emit(
            sink,
            WorkflowEvent::NodeStarted {
                node_id: node.id.clone(),
                node_type: node_type.to_string(),
            },
        );

        let policy = RetryPolicy::from_config(node.retry.as_ref().unwrap_or(&self.engine.retry));
        let ctx = NodeContext::new(node, &self.graph, &self.services, &self.run_id, sink)
            .with_cancel(self.cancel.as_ref());
        let ctx = &ctx;
        let started = Instant::now();
        let result = with_retry(
            move |_| nodes::execute(ctx, state),
            &policy,
            |attempt, delay, e| {
                emit(
                    sink,
                    WorkflowEvent::NodeRetry {
                        node_id: node.id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    },
                )
            },
        )
        .await;
        let elapsed = started.elapsed();

        let (status, output, error) = match &result {
            Ok(outcome) => (RunStatus::Succeeded, Some(outcome.output.clone()), None),
            Err(e) => {
                error!(node_id = %node.id, node_type, error = %e, "Node failed");
                (RunStatus::Failed, None, Some(e.to_string()))
            }
        };
        emit(
            sink,
            WorkflowEvent::NodeFinished {
                node_id: node.id.clone(),
                node_type: node_type.to_string(),
                status,
                error: error.clone(),
                elapsed_time: elapsed.as_secs_f64(),
            },
        );

        let record = NodeRecord {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            node_type: node_type.to_string(),
            status,
            output,
            error,
            elapsed_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.recorder.record_node(record).await {
            warn!(node_id = %node.id, error = %e, "Failed to record node");
        }

        result
    }

    async fn record_run(
        &self,
        mode: RunMode,
        status: RunStatus,
        state: &ExecutionState,
        outputs: Option<Value>,
        error: Option<String>,
        elapsed: Option<Duration>,
    ) {
        let record = RunRecord {
            run_id: self.run_id.clone(),
            workflow_type: mode.as_str().to_string(),
            status,
            inputs: state.inputs.clone().into_iter().collect(),
            outputs,
            error,
            elapsed_ms: elapsed.map(|d| d.as_millis() as u64),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.recorder.record_run(record).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to record run");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

fn emit(sink: &EventSink, event: WorkflowEvent) {
    // A closed receiver means the caller stopped listening; keep running.
    let _ = sink.send(event);
}

fn commit(state: &mut ExecutionState, node_id: &str, outcome: NodeOutcome) {
    state.set_output(node_id, outcome.output);
    for effect in outcome.effects {
        state.apply(effect);
    }
}

fn final_outputs(mode: RunMode, state: &ExecutionState) -> Value {
    match mode {
        RunMode::Batch => state
            .output(WORKFLOW_OUTPUT_KEY)
            .cloned()
            .unwrap_or_else(|| Value::Object(state.outputs_map())),
        RunMode::Conversational => json!({"answer": state.final_answer().unwrap_or_default()}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use strand_test_utils::{edge, graph, handle_edge, node, FnTool, MemoryRecorder, ScriptedLlm, ScriptedTurn};
    use strand_tools::ToolRegistry;
    use strand_core::config::ModelConfig;

    fn runner(payload: Value, llm: ScriptedLlm) -> WorkflowRunner {
        let graph = Arc::new(WorkflowGraph::from_value(payload).unwrap());
        let services = Arc::new(NodeServices::new(Arc::new(llm), ModelConfig::new("test-model")));
        WorkflowRunner::new(graph, services)
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn batch(runner: WorkflowRunner, input: Value) -> (RunReport, Vec<WorkflowEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = runner.run_batch(inputs(input), &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (report, events)
    }

    fn started(events: &[WorkflowEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::NodeStarted { node_id, .. } => Some(node_id.as_str()),
                _ => None,
            })
            .collect()
    }

    fn no_llm() -> ScriptedLlm {
        ScriptedLlm::new(vec![])
    }

    #[tokio::test]
    async fn test_linear_batch_run() {
        let payload = graph(
            vec![
                node("start", "start", json!({"variables": [{"variable": "name", "default": "world"}]})),
                node("greet", "template", json!({"template": "Hello {{name}}"})),
                node("end", "end", json!({"outputs": [{"variable_selector": ["greet", "output"], "variable_name": "greeting"}]})),
            ],
            vec![edge("start", "greet"), edge("greet", "end")],
        );
        let (report, events) = batch(runner(payload, no_llm()), json!({})).await;

        assert!(report.succeeded());
        assert_eq!(report.outputs, Some(json!({"greeting": "Hello world"})));
        assert_eq!(started(&events), vec!["start", "greet", "end"]);
        assert_eq!(events.first().unwrap().name(), "workflow_started");
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_self_loop_halts() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("loop", "template", json!({"template": "again"})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "loop"), edge("loop", "loop"), edge("loop", "end")],
        );
        let (report, events) = batch(runner(payload, no_llm()), json!({})).await;
        assert!(report.succeeded());
        assert_eq!(started(&events), vec!["start", "loop", "end"]);
    }

    #[tokio::test]
    async fn test_end_collects_both_predecessors() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("a", "template", json!({"template": "A"})),
                node("b", "template", json!({"template": "B"})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "a"), edge("start", "b"), edge("a", "end"), edge("b", "end")],
        );
        let (report, events) = batch(runner(payload, no_llm()), json!({})).await;
        assert_eq!(
            report.outputs,
            Some(json!({"a": {"output": "A"}, "b": {"output": "B"}}))
        );
        assert_eq!(started(&events).iter().filter(|id| **id == "end").count(), 1);
    }

    #[tokio::test]
    async fn test_branch_routing_follows_handle() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("check", "if-else", json!({"conditions": [{"variable": "x", "operator": ">", "value": "5"}]})),
                node("big", "template", json!({"template": "big"})),
                node("small", "template", json!({"template": "small"})),
            ],
            vec![
                edge("start", "check"),
                handle_edge("check", "big", "true"),
                handle_edge("check", "small", "false"),
            ],
        );
        let (report, events) = batch(runner(payload.clone(), no_llm()), json!({"x": "10"})).await;
        assert_eq!(started(&events), vec!["start", "check", "big"]);
        assert!(report.node_outputs.contains_key("big"));
        assert!(!report.node_outputs.contains_key("small"));

        let (_, events) = batch(runner(payload, no_llm()), json!({"x": "abc"})).await;
        // "abc" > "5" as text
        assert_eq!(started(&events), vec!["start", "check", "big"]);
    }

    #[tokio::test]
    async fn test_without_end_all_outputs_are_returned() {
        let payload = graph(
            vec![node("start", "start", json!({})), node("t", "template", json!({"template": "x"}))],
            vec![edge("start", "t")],
        );
        let (report, _) = batch(runner(payload, no_llm()), json!({"k": 1})).await;
        let outputs = report.outputs.unwrap();
        assert_eq!(outputs["t"], json!({"output": "x"}));
        assert!(outputs.get("start").is_some());
    }

    #[tokio::test]
    async fn test_retry_emits_node_retry_then_succeeds() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("llm", "llm", json!({"prompt": "hi", "retry": {"max_retries": 2, "base_delay_ms": 1}})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "llm"), edge("llm", "end")],
        );
        let llm = ScriptedLlm::new(vec![ScriptedTurn::fail("HTTP 503"), ScriptedTurn::text("hello")]);
        let (report, events) = batch(runner(payload, llm), json!({})).await;

        assert!(report.succeeded());
        let retries: Vec<&WorkflowEvent> = events.iter().filter(|e| e.name() == "node_retry").collect();
        assert_eq!(retries.len(), 1);
        match retries[0] {
            WorkflowEvent::NodeRetry { node_id, attempt, delay_ms, .. } => {
                assert_eq!(node_id, "llm");
                assert_eq!(*attempt, 1);
                assert_eq!(*delay_ms, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.node_outputs["llm"], json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_node_failure_fails_run() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("tool", "tool", json!({"tool_name": "flaky"})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "tool"), edge("tool", "end")],
        );
        let tools = ToolRegistry::builder().register(FnTool::failing("flaky", "boom")).build();
        let services = NodeServices::new(Arc::new(no_llm()), ModelConfig::new("test-model")).with_tools(tools);
        let runner = WorkflowRunner::new(Arc::new(WorkflowGraph::from_value(payload).unwrap()), Arc::new(services));
        let (report, events) = batch(runner, json!({})).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.node_outputs.contains_key("start"));
        let finished: Vec<&WorkflowEvent> = events.iter().filter(|e| e.name() == "node_finished").collect();
        assert!(matches!(
            finished.last().unwrap(),
            WorkflowEvent::NodeFinished { status: RunStatus::Failed, node_id, .. } if node_id == "tool"
        ));
        match events.last().unwrap() {
            WorkflowEvent::WorkflowFinished { status, outputs, error, .. } => {
                assert_eq!(*status, RunStatus::Failed);
                assert!(outputs.is_none());
                assert!(error.as_ref().unwrap().contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(report.into_result().unwrap_err(), StrandError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_before_any_node_runs() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("effect", "template", json!({"template": "side effect"})),
                node("t", "tool", json!({"tool_name": "no_such_tool"})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "effect"), edge("effect", "t"), edge("t", "end")],
        );
        let (report, events) = batch(runner(payload, no_llm()), json!({})).await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(started(&events).is_empty());
        assert!(report.node_outputs.is_empty());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        let err = report.into_result().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("no_such_tool"));
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_rejected() {
        let payload = graph(
            vec![node("start", "start", json!({})), node("reply", "answer", json!({"answer": "hi"}))],
            vec![edge("start", "reply")],
        );
        let (report, events) = batch(runner(payload, no_llm()), json!({})).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert!(started(&events).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() {
        let payload = graph(
            vec![node("start", "start", json!({})), node("end", "end", json!({}))],
            vec![edge("start", "end")],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (report, events) = batch(runner(payload, no_llm()).with_cancel(cancel), json!({})).await;
        assert_eq!(report.status, RunStatus::Stopped);
        assert!(started(&events).is_empty());
        assert!(matches!(
            events.last().unwrap(),
            WorkflowEvent::WorkflowFinished { status: RunStatus::Stopped, .. }
        ));
    }

    #[tokio::test]
    async fn test_parallel_branches_share_state() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("a", "template", json!({"template": "A{{q}}"})),
                node("b", "template", json!({"template": "B{{q}}"})),
                node("join", "template", json!({"template": "{{a.output}}+{{b.output}}"})),
                node("end", "end", json!({"outputs": [{"variable_selector": ["join", "output"], "variable_name": "joined"}]})),
            ],
            vec![
                edge("start", "a"),
                edge("start", "b"),
                edge("a", "join"),
                edge("b", "join"),
                edge("join", "end"),
            ],
        );
        let engine = EngineConfig {
            parallel_branches: true,
            ..EngineConfig::default()
        };
        let (report, events) = batch(runner(payload, no_llm()).with_engine(engine), json!({"q": "1"})).await;
        assert!(report.succeeded());
        assert_eq!(report.outputs, Some(json!({"joined": "A1+B1"})));
        assert_eq!(started(&events).iter().filter(|id| **id == "join").count(), 1);
    }

    #[tokio::test]
    async fn test_conversation_turn_streams_answer() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("llm", "llm", json!({"prompt": "{{sys.query}}"})),
                node("remember", "assigner", json!({"assignments": [
                    {"variable": "last_topic", "value": "{{query}}", "scope": "conversation"}
                ]})),
                node("reply", "answer", json!({"answer": "{{llm.text}}"})),
            ],
            vec![edge("start", "llm"), edge("llm", "remember"), edge("remember", "reply")],
        );
        let llm = ScriptedLlm::new(vec![ScriptedTurn::text("Hi there")]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let turn = ConversationTurn::new("hello", "conv-1");
        let report = runner(payload, llm).run_conversation(turn, &tx).await;
        drop(tx);

        assert!(report.succeeded());
        assert_eq!(report.answer(), Some("Hi there"));
        assert_eq!(report.conversation_variables["last_topic"], json!("hello"));

        let mut chunks = String::new();
        while let Some(event) = rx.recv().await {
            if let WorkflowEvent::NodeOutput { node_id, chunk } = event {
                if node_id == "reply" {
                    chunks.push_str(&chunk);
                }
            }
        }
        assert_eq!(chunks, "Hi there");

        let next = ConversationTurn::follow_up(&report, "again", "conv-1");
        assert_eq!(next.dialogue_count, 1);
        assert_eq!(next.conversation_variables["last_topic"], json!("hello"));
    }

    #[tokio::test]
    async fn test_recorder_sees_run_and_nodes() {
        let payload = graph(
            vec![node("start", "start", json!({})), node("end", "end", json!({}))],
            vec![edge("start", "end")],
        );
        let recorder = Arc::new(MemoryRecorder::new());
        let (report, _) = batch(
            runner(payload, no_llm())
                .with_recorder(recorder.clone())
                .with_run_id(RunId::from_str("run-42")),
            json!({}),
        )
        .await;
        assert!(report.succeeded());

        let runs = recorder.runs.lock().unwrap();
        let statuses: Vec<RunStatus> = runs.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RunStatus::Running, RunStatus::Succeeded]);
        assert_eq!(runs[0].run_id.0, "run-42");
        assert_eq!(recorder.nodes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_broken_recorder_never_fails_run() {
        let payload = graph(
            vec![node("start", "start", json!({})), node("end", "end", json!({}))],
            vec![edge("start", "end")],
        );
        let (report, _) = batch(
            runner(payload, no_llm()).with_recorder(Arc::new(MemoryRecorder::broken())),
            json!({}),
        )
        .await;
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_system_variables_are_resolvable() {
        let payload = graph(
            vec![
                node("start", "start", json!({})),
                node("t", "template", json!({"template": "{{sys.user_id}}/{{sys.workflow_run_id}}"})),
                node("end", "end", json!({"outputs": [{"variable_selector": ["t", "output"], "variable_name": "who"}]})),
            ],
            vec![edge("start", "t"), edge("t", "end")],
        );
        let runner = runner(payload, no_llm())
            .with_run_id(RunId::from_str("r1"))
            .with_system_variable(system_keys::USER_ID, "u7");
        let (report, _) = batch(runner, json!({})).await;
        assert_eq!(report.outputs, Some(json!({"who": "u7/r1"})));
    }
}
