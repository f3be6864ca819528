use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};

use super::NodeKind;

/// Per-node model override: `{provider?, name|model_id?, temperature?, max_tokens?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverride {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default, alias = "model_id")]
    pub name: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ModelOverride {
    /// Layer this override on top of `base`.
    pub fn apply(&self, base: &ModelConfig) -> ModelConfig {
        let mut model = base.clone();
        if let Some(provider) = self.provider.as_ref().filter(|p| !p.is_empty()) {
            model.provider = provider.clone();
        }
        if let Some(name) = self.name.as_ref().filter(|n| !n.is_empty()) {
            model.model_id = name.clone();
        }
        if let Some(t) = self.temperature {
            model.temperature = t;
        }
        if let Some(max) = self.max_tokens {
            model.max_tokens = max;
        }
        model
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartConfig {
    #[serde(default)]
    pub variables: Vec<StartVariable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartVariable {
    #[serde(alias = "name")]
    pub variable: String,
    #[serde(default, alias = "defaultValue")]
    pub default: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<ModelOverride>,
}

/// Comparison operator of one condition clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Comparator {
    #[default]
    #[serde(rename = "==", alias = "=", alias = "equals")]
    Equal,
    #[serde(rename = "!=", alias = "not_equals")]
    NotEqual,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not contains", alias = "not_contains")]
    NotContains,
    #[serde(rename = "is empty", alias = "is_empty")]
    IsEmpty,
    #[serde(rename = "is not empty", alias = "is_not_empty")]
    IsNotEmpty,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Clause {
    #[serde(default)]
    pub variable: String,
    #[serde(default)]
    pub operator: Comparator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseConfig {
    #[serde(alias = "id")]
    pub case_id: String,
    #[serde(default)]
    pub conditions: Vec<Clause>,
    #[serde(default, alias = "logicOp")]
    pub logical_operator: LogicalOperator,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub conditions: Vec<Clause>,
    #[serde(default, alias = "logicOp")]
    pub logical_operator: LogicalOperator,
    /// When non-empty the node runs in multi-branch mode.
    #[serde(default)]
    pub cases: Vec<CaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub query_variable: String,
    #[serde(default)]
    pub classes: Vec<ClassSpec>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub model: Option<ModelOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListOperation {
    #[default]
    First,
    Last,
    Limit,
    Slice,
    Sort,
    Unique,
    Flatten,
    Filter,
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Item predicate of a `filter` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Greater,
    Less,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default, deserialize_with = "optional_condition")]
    pub condition: Option<FilterCondition>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListOperatorConfig {
    #[serde(default)]
    pub variable: String,
    #[serde(default)]
    pub operation: ListOperation,
    #[serde(default)]
    pub params: ListParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IterationConfig {
    #[serde(default)]
    pub input_variable: String,
    #[serde(default = "default_items_key")]
    pub output_variable: String,
    #[serde(default)]
    pub operation: Option<ListOperation>,
    #[serde(default)]
    pub params: ListParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    #[default]
    Python,
    #[serde(alias = "js", alias = "node")]
    Javascript,
    #[serde(alias = "sh", alias = "shell")]
    Bash,
}

impl CodeLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Bash => "bash",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeNodeConfig {
    #[serde(default)]
    pub language: CodeLanguage,
    pub code: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// HTTP verb, matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl TryFrom<String> for HttpMethod {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            other => Err(format!("unsupported HTTP method '{}'", other)),
        }
    }
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
            Self::Head => reqwest::Method::HEAD,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
        }
    }

    /// Whether a configured body is sent with this method.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpNodeConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// A template string or a JSON structure resolved deeply.
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolNodeConfig {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    #[default]
    #[serde(alias = "variables")]
    Variable,
    Conversation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assignment {
    #[serde(alias = "name")]
    pub variable: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub scope: VariableScope,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignConfig {
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub query: String,
    #[serde(default, alias = "knowledge_id", deserialize_with = "string_list")]
    pub knowledge_base_ids: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentConfig {
    #[serde(default)]
    pub variable: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default = "default_param_type", rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default)]
    pub input_text: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub model: Option<ModelOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentKnowledgeOptions {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: Option<f64>,
    #[serde(default = "default_true")]
    pub fallback_to_model: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentNodeConfig {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default = "default_agent_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub model: Option<ModelOverride>,
    #[serde(default, deserialize_with = "string_list")]
    pub knowledge_base_ids: Vec<String>,
    #[serde(default)]
    pub knowledge_settings: Option<AgentKnowledgeOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerConfig {
    #[serde(default)]
    pub answer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputMapping {
    #[serde(default)]
    pub variable_selector: Vec<String>,
    #[serde(default = "default_output_name")]
    pub variable_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndConfig {
    #[serde(default)]
    pub outputs: Vec<OutputMapping>,
}

/// Typed configuration, one variant per [`NodeKind`].
#[derive(Debug, Clone)]
pub enum NodeConfig {
    Start(StartConfig),
    Llm(LlmConfig),
    Condition(ConditionConfig),
    Code(CodeNodeConfig),
    Http(HttpNodeConfig),
    Assign(AssignConfig),
    Knowledge(KnowledgeConfig),
    Iteration(IterationConfig),
    Tool(ToolNodeConfig),
    Classifier(ClassifierConfig),
    Document(DocumentConfig),
    ListOperator(ListOperatorConfig),
    Template(TemplateConfig),
    Extractor(ExtractorConfig),
    Agent(AgentNodeConfig),
    Answer(AnswerConfig),
    End(EndConfig),
}

impl NodeConfig {
    /// Decode `data` for a node of `kind`, rejecting malformed configs.
    pub fn parse(kind: NodeKind, node_id: &str, data: &Value) -> Result<Self> {
        let config = match kind {
            NodeKind::Start => Self::Start(decode(kind, node_id, data)?),
            NodeKind::Llm => Self::Llm(decode(kind, node_id, data)?),
            NodeKind::IfElse => Self::Condition(decode(kind, node_id, data)?),
            NodeKind::Code => Self::Code(decode(kind, node_id, data)?),
            NodeKind::HttpRequest => Self::Http(decode(kind, node_id, data)?),
            NodeKind::VariableAssign => Self::Assign(decode(kind, node_id, data)?),
            NodeKind::KnowledgeRetrieval => Self::Knowledge(decode(kind, node_id, data)?),
            NodeKind::Iteration => Self::Iteration(decode(kind, node_id, data)?),
            NodeKind::Tool => {
                let config: ToolNodeConfig = decode(kind, node_id, data)?;
                if config.tool_name.trim().is_empty() {
                    return Err(invalid(kind, node_id, "tool_name is required"));
                }
                Self::Tool(config)
            }
            NodeKind::QuestionClassifier => {
                let config: ClassifierConfig = decode(kind, node_id, data)?;
                if config.classes.is_empty() {
                    return Err(invalid(kind, node_id, "at least one class is required"));
                }
                Self::Classifier(config)
            }
            NodeKind::DocumentExtractor => Self::Document(decode(kind, node_id, data)?),
            NodeKind::ListOperator => Self::ListOperator(decode(kind, node_id, data)?),
            NodeKind::TemplateTransform => Self::Template(decode(kind, node_id, data)?),
            NodeKind::ParameterExtractor => Self::Extractor(decode(kind, node_id, data)?),
            NodeKind::Agent => Self::Agent(decode(kind, node_id, data)?),
            NodeKind::Answer => Self::Answer(decode(kind, node_id, data)?),
            NodeKind::End => Self::End(decode(kind, node_id, data)?),
        };
        Ok(config)
    }
}

fn decode<T: DeserializeOwned>(kind: NodeKind, node_id: &str, data: &Value) -> Result<T> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data.clone()
    };
    serde_json::from_value(data).map_err(|e| invalid(kind, node_id, &e.to_string()))
}

fn invalid(kind: NodeKind, node_id: &str, message: &str) -> StrandError {
    StrandError::Config(format!("{} node '{}': {}", kind, node_id, message))
}

/// Accept a single id or a list of ids; numbers are stringified.
fn string_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    fn scalar(v: &Value) -> Option<String> {
        match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items.iter().filter_map(scalar).collect(),
        other => scalar(&other).into_iter().collect(),
    })
}

/// An empty string means "no condition".
fn optional_condition<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<FilterCondition>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn default_items_key() -> String { "items".to_string() }
fn default_output_name() -> String { "output".to_string() }
fn default_param_type() -> String { "string".to_string() }
fn default_top_k() -> usize { 3 }
fn default_agent_iterations() -> usize { 5 }
fn default_true() -> bool { true }
