use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Top-level Strand configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub mcp: Option<McpConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Extra HTTP headers sent with every request.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            extra_headers: HashMap::new(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.7 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Defaults for standalone and embedded agent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool names exposed to the agent (empty = all registered tools).
    #[serde(default)]
    pub enabled_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            system_prompt: None,
            enabled_tools: Vec::new(),
        }
    }
}

fn default_max_iterations() -> usize { 8 }

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running branches in a fan-out.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Run sibling branches through the parallel controller.
    #[serde(default)]
    pub parallel_branches: bool,
    #[serde(default)]
    pub retry: NodeRetryConfig,
    #[serde(default)]
    pub code: CodeConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            parallel_branches: false,
            retry: NodeRetryConfig::default(),
            code: CodeConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

fn default_max_concurrency() -> usize { 4 }

/// Per-node retry settings. Also accepted as `data.retry` on a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_exponential")]
    pub exponential: bool,
}

impl Default for NodeRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            exponential: default_exponential(),
        }
    }
}

fn default_base_delay_ms() -> u64 { 1000 }
fn default_exponential() -> bool { true }

/// Code node sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeConfig {
    /// "process" runs a local interpreter, "docker" runs in a throwaway container.
    #[serde(default = "default_sandbox")]
    pub sandbox: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_node")]
    pub node: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            sandbox: default_sandbox(),
            python: default_python(),
            node: default_node(),
            timeout_secs: default_timeout_secs(),
            image: default_image(),
            memory_mb: default_memory_mb(),
        }
    }
}

fn default_sandbox() -> String { "process".to_string() }
fn default_python() -> String { "python3".to_string() }
fn default_node() -> String { "node".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_image() -> String { "python:3.12-slim".to_string() }
fn default_memory_mb() -> u64 { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// MCP (Model Context Protocol) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub transport: McpTransport,
    /// Per-tool-call timeout in seconds. Default: 120.
    #[serde(default = "default_mcp_timeout")]
    pub timeout_secs: u64,
}

impl McpServerConfig {
    /// A streamable-HTTP server at `url` with default settings.
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            transport: McpTransport::Sse { url: url.into() },
            timeout_secs: default_mcp_timeout(),
        }
    }
}

fn default_mcp_timeout() -> u64 { 120 }

/// MCP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn dir(&self) -> PathBuf {
        if let Some(rest) = self.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.log_dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded)
            .map_err(|e| StrandError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
