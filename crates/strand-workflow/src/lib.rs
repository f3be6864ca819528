//! Workflow graphs for Strand.
//!
//! A [`WorkflowGraph`] is loaded and validated once, then handed to a
//! [`WorkflowRunner`] that walks it against a fresh [`ExecutionState`],
//! pushing [`WorkflowEvent`]s on a channel as nodes start, stream and finish.

pub mod controller;
pub mod event;
pub mod graph;
pub mod nodes;
pub mod protocol;
pub mod recorder;
pub mod resolver;
pub mod runner;
pub mod sandbox;
pub mod state;

pub use controller::{run_parallel, with_retry, RetryPolicy, TaskReport};
pub use event::{EventSink, WorkflowEvent};
pub use graph::{GraphDefinition, NodeKind, RunMode, WorkflowGraph};
pub use nodes::{NodeOutcome, NodeServices};
pub use protocol::{agent_frames, frames, SseEncoder, DONE_SENTINEL};
pub use recorder::JsonlRecorder;
pub use runner::{ConversationTurn, RunReport, WorkflowRunner};
pub use sandbox::{CodeSandbox, DockerSandbox, ProcessSandbox};
pub use state::{ExecutionState, StateEffect};
