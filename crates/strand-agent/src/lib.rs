pub mod agent_loop;
pub mod event;
pub mod knowledge;

pub use agent_loop::{AgentLoop, AgentOutcome, AgentRequest, AgentTerminal, ITERATION_LIMIT_MESSAGE};
pub use event::{AgentEvent, ToolCall, ToolRecord};
pub use knowledge::{KnowledgeSettings, NO_KNOWLEDGE_MESSAGE};
