pub mod config;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use strand_core::config::NodeRetryConfig;
use strand_core::error::{Result, StrandError};
use strand_tools::ToolRegistry;

pub use config::NodeConfig;

/// Raw graph payload: `{nodes:[{id,type,data}], edges:[{id,source,target,sourceHandle?}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// One node as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl NodeSpec {
    /// The declared type name: `data.type` first, then the node's own `type`.
    pub fn type_name(&self) -> Option<&str> {
        self.data
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .or(self.node_type.as_deref())
    }
}

/// A directed edge, optionally taken only for one branch handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, rename = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl EdgeSpec {
    /// The routing handle, treating an empty string as none.
    pub fn handle(&self) -> Option<&str> {
        self.source_handle.as_deref().filter(|h| !h.is_empty())
    }
}

/// The closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Start,
    Llm,
    IfElse,
    Code,
    HttpRequest,
    VariableAssign,
    KnowledgeRetrieval,
    Iteration,
    Tool,
    QuestionClassifier,
    DocumentExtractor,
    ListOperator,
    TemplateTransform,
    ParameterExtractor,
    Agent,
    Answer,
    End,
}

impl NodeKind {
    /// Parse a type name, accepting the historical aliases.
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name.trim().to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "llm" => Self::Llm,
            "if-else" | "condition" => Self::IfElse,
            "code" => Self::Code,
            "http-request" | "http" => Self::HttpRequest,
            "variable-assign" | "variable-aggregator" | "variable" | "assigner" => {
                Self::VariableAssign
            }
            "knowledge-retrieval" | "knowledge" => Self::KnowledgeRetrieval,
            "iteration" => Self::Iteration,
            "tool" => Self::Tool,
            "question-classifier" | "classifier" => Self::QuestionClassifier,
            "document-extractor" => Self::DocumentExtractor,
            "list-operator" => Self::ListOperator,
            "template-transform" | "template" => Self::TemplateTransform,
            "parameter-extractor" | "extractor" => Self::ParameterExtractor,
            "agent" => Self::Agent,
            "answer" => Self::Answer,
            "end" => Self::End,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Llm => "llm",
            Self::IfElse => "if-else",
            Self::Code => "code",
            Self::HttpRequest => "http-request",
            Self::VariableAssign => "variable-assign",
            Self::KnowledgeRetrieval => "knowledge-retrieval",
            Self::Iteration => "iteration",
            Self::Tool => "tool",
            Self::QuestionClassifier => "question-classifier",
            Self::DocumentExtractor => "document-extractor",
            Self::ListOperator => "list-operator",
            Self::TemplateTransform => "template-transform",
            Self::ParameterExtractor => "parameter-extractor",
            Self::Agent => "agent",
            Self::Answer => "answer",
            Self::End => "end",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which runner variant a graph is executed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Terminal `end`, all outputs at once.
    Batch,
    /// Terminal `answer`, streamed reply, conversation-scoped variables.
    Conversational,
}

impl RunMode {
    /// The node type that ends a run in this mode.
    pub fn terminal(&self) -> NodeKind {
        match self {
            Self::Batch => NodeKind::End,
            Self::Conversational => NodeKind::Answer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "workflow",
            Self::Conversational => "chatflow",
        }
    }
}

/// A validated node with its typed configuration.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub config: NodeConfig,
    /// Per-node override of the engine retry policy.
    pub retry: Option<NodeRetryConfig>,
}

/// A validated, immutable workflow graph.
///
/// Construction checks ids, edge endpoints and every node config, so nothing
/// past [`WorkflowGraph::load`] has to deal with a malformed payload.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeSpec>,
    start: usize,
}

impl WorkflowGraph {
    /// Validate a definition and resolve every node config.
    pub fn load(definition: &GraphDefinition) -> Result<Self> {
        if definition.nodes.is_empty() {
            return Err(StrandError::Graph("graph has no nodes".into()));
        }

        let mut nodes = Vec::with_capacity(definition.nodes.len());
        let mut index = HashMap::new();
        for spec in &definition.nodes {
            if spec.id.is_empty() {
                return Err(StrandError::Graph("node with empty id".into()));
            }
            if index.contains_key(&spec.id) {
                return Err(StrandError::Graph(format!("duplicate node id '{}'", spec.id)));
            }
            let type_name = spec.type_name().unwrap_or_default();
            let kind = NodeKind::parse(type_name).ok_or_else(|| StrandError::UnknownNodeType {
                node_id: spec.id.clone(),
                node_type: type_name.to_string(),
            })?;
            let config = NodeConfig::parse(kind, &spec.id, &spec.data)?;
            let retry = match spec.data.get("retry") {
                Some(v) if !v.is_null() => Some(
                    serde_json::from_value::<NodeRetryConfig>(v.clone()).map_err(|e| {
                        StrandError::Config(format!("node '{}' retry: {}", spec.id, e))
                    })?,
                ),
                _ => None,
            };
            index.insert(spec.id.clone(), nodes.len());
            nodes.push(Node {
                id: spec.id.clone(),
                kind,
                config,
                retry,
            });
        }

        for edge in &definition.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !index.contains_key(endpoint) {
                    return Err(StrandError::Graph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
        }

        let start = nodes
            .iter()
            .position(|n| n.kind == NodeKind::Start)
            .unwrap_or(0);

        debug!(
            nodes = nodes.len(),
            edges = definition.edges.len(),
            start = %nodes[start].id,
            "Graph loaded"
        );

        Ok(Self {
            nodes,
            index,
            edges: definition.edges.clone(),
            start,
        })
    }

    /// Parse and validate a JSON payload.
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: GraphDefinition = serde_json::from_str(json)
            .map_err(|e| StrandError::Graph(format!("malformed graph payload: {}", e)))?;
        Self::load(&definition)
    }

    /// Parse and validate an already-decoded payload.
    pub fn from_value(value: Value) -> Result<Self> {
        let definition: GraphDefinition = serde_json::from_value(value)
            .map_err(|e| StrandError::Graph(format!("malformed graph payload: {}", e)))?;
        Self::load(&definition)
    }

    /// Reject node types that do not belong to `mode`.
    pub fn check_mode(&self, mode: RunMode) -> Result<()> {
        let forbidden = match mode {
            RunMode::Batch => NodeKind::Answer,
            RunMode::Conversational => NodeKind::End,
        };
        if let Some(node) = self.nodes.iter().find(|n| n.kind == forbidden) {
            return Err(StrandError::Graph(format!(
                "'{}' node {} is not allowed in a {} graph",
                forbidden,
                node.id,
                mode.as_str()
            )));
        }
        Ok(())
    }

    /// Reject `tool` nodes naming a tool `tools` does not provide.
    pub fn check_tools(&self, tools: &ToolRegistry) -> Result<()> {
        for node in &self.nodes {
            if let NodeConfig::Tool(config) = &node.config {
                if !tools.contains(&config.tool_name) {
                    return Err(StrandError::Config(format!(
                        "tool node '{}': unknown tool '{}'",
                        node.id, config.tool_name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// The first `start` node, else the first node.
    pub fn start_node(&self) -> &Node {
        &self.nodes[self.start]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges leaving `id`, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// Distinct sources of edges entering `id`, in declaration order.
    pub fn incoming_sources(&self, id: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Targets to enqueue after `id` ran with the given branch signal.
    ///
    /// With a signal, edges whose handle matches it are taken; when none
    /// match, the handle-less defaults are. Without a signal only the
    /// handle-less edges are taken.
    pub fn next_targets(&self, id: &str, branch: Option<&str>) -> Vec<String> {
        let edges: Vec<&EdgeSpec> = self.outgoing(id).collect();
        let defaults = || {
            edges
                .iter()
                .filter(|e| e.handle().is_none())
                .map(|e| e.target.clone())
                .collect::<Vec<_>>()
        };
        match branch {
            Some(signal) => {
                let matched: Vec<String> = edges
                    .iter()
                    .filter(|e| e.handle() == Some(signal))
                    .map(|e| e.target.clone())
                    .collect();
                if matched.is_empty() {
                    defaults()
                } else {
                    matched
                }
            }
            None => defaults(),
        }
    }
}

/// Read a node's branch signal from its output.
///
/// `branch_id` wins; a legacy boolean `result` maps to `"true"` / `"false"`.
pub fn branch_signal(output: &Value) -> Option<String> {
    match output.get("branch_id") {
        Some(Value::String(s)) => return Some(s.clone()),
        Some(Value::Bool(b)) => return Some(b.to_string()),
        Some(Value::Number(n)) => return Some(n.to_string()),
        _ => {}
    }
    output
        .get("result")
        .and_then(Value::as_bool)
        .map(|b| b.to_string())
}
