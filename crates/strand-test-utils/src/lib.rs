mod fixtures;
mod llm;
mod recorder;
mod tools;

pub use fixtures::{edge, graph, handle_edge, node};
pub use llm::{ScriptedLlm, ScriptedTurn};
pub use recorder::MemoryRecorder;
pub use tools::{FailingRetriever, FnTool, StaticRetriever};
