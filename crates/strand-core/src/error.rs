use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Configuration errors (fail fast, before any side effect)
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Unknown node type '{node_type}' for node {node_id}")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("Invalid graph: {0}")]
    Graph(String),

    // Transport errors (retryable)
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Parse errors (degrade, never abort)
    #[error("Parse error: {0}")]
    Parse(String),

    // Execution errors
    #[error("Node {node_id} failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Iteration limit reached ({0})")]
    IterationLimit(usize),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    // MCP errors
    #[error("MCP error: {0}")]
    Mcp(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    /// Whether this error came from a model or HTTP transport.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StrandError::LlmRequest(_) | StrandError::LlmStream(_) | StrandError::Http(_)
        )
    }

    /// Whether this error means the graph or a node config is unusable.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StrandError::Config(_)
                | StrandError::ConfigNotFound(_)
                | StrandError::UnknownNodeType { .. }
                | StrandError::Graph(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;
