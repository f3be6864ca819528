use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use strand_core::types::RunStatus;

/// Channel the runner and node executors push events on.
pub type EventSink = mpsc::UnboundedSender<WorkflowEvent>;

/// Execution events of one workflow run, tagged by `event` on the wire.
///
/// Every run emits exactly one `WorkflowFinished`, last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_run_id: String,
        inputs: Value,
    },

    NodeStarted {
        node_id: String,
        node_type: String,
    },

    /// Incremental progress of a running node (token text, counters).
    NodeOutput {
        node_id: String,
        chunk: String,
    },

    /// A failed attempt is about to be retried after `delay_ms`.
    NodeRetry {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    NodeFinished {
        node_id: String,
        node_type: String,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Seconds.
        elapsed_time: f64,
    },

    WorkflowFinished {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Seconds.
        elapsed_time: f64,
    },
}

impl WorkflowEvent {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeOutput { .. } => "node_output",
            Self::NodeRetry { .. } => "node_retry",
            Self::NodeFinished { .. } => "node_finished",
            Self::WorkflowFinished { .. } => "workflow_finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowFinished { .. })
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeOutput { node_id, .. }
            | Self::NodeRetry { node_id, .. }
            | Self::NodeFinished { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}
