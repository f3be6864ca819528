use serde_json::{Map, Value};

/// Reserved output key holding a conversational run's reply.
pub const FINAL_ANSWER_KEY: &str = "final_answer";

/// Reserved output key holding a batch run's collected result.
pub const WORKFLOW_OUTPUT_KEY: &str = "__workflow_output__";

/// Temp key written by branch-selecting nodes.
pub const SELECTED_BRANCH_KEY: &str = "selected_branch";

/// A state change requested by a node, applied by the runner after the
/// node's attempt succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEffect {
    /// Set an input only if the run did not provide it.
    SeedInput { key: String, value: Value },
    Temp { key: String, value: Value },
    Variable { key: String, value: Value },
    ConversationVariable { key: String, value: Value },
    FinalAnswer(String),
    WorkflowOutput(Value),
}

/// Mutable state of one run.
///
/// Node outputs keep their insertion order so lookups that scan "the first
/// upstream output carrying a key" are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub inputs: Map<String, Value>,
    outputs: Vec<(String, Value)>,
    pub temp_data: Map<String, Value>,
    pub variables: Map<String, Value>,
    pub conversation_variables: Map<String, Value>,
    pub system_variables: Map<String, Value>,
}

impl ExecutionState {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    /// Output of a node (or a reserved key), if written.
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn has_output(&self, key: &str) -> bool {
        self.output(key).is_some()
    }

    /// Write an output slot, replacing any earlier value for the same key.
    pub fn set_output(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.outputs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.outputs.push((key, value)),
        }
    }

    /// Outputs in the order they were written.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The most recently written node output, ignoring reserved keys.
    pub fn last_output(&self) -> Option<&Value> {
        self.outputs
            .iter()
            .rev()
            .find(|(k, _)| k != FINAL_ANSWER_KEY && k != WORKFLOW_OUTPUT_KEY)
            .map(|(_, v)| v)
    }

    /// Node outputs as one JSON object, reserved keys included.
    pub fn outputs_map(&self) -> Map<String, Value> {
        self.outputs.iter().cloned().collect()
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.output(FINAL_ANSWER_KEY).and_then(Value::as_str)
    }

    pub fn apply(&mut self, effect: StateEffect) {
        match effect {
            StateEffect::SeedInput { key, value } => {
                self.inputs.entry(key).or_insert(value);
            }
            StateEffect::Temp { key, value } => {
                self.temp_data.insert(key, value);
            }
            StateEffect::Variable { key, value } => {
                self.variables.insert(key, value);
            }
            StateEffect::ConversationVariable { key, value } => {
                self.conversation_variables.insert(key, value);
            }
            StateEffect::FinalAnswer(answer) => {
                self.set_output(FINAL_ANSWER_KEY, Value::String(answer));
            }
            StateEffect::WorkflowOutput(value) => {
                self.set_output(WORKFLOW_OUTPUT_KEY, value);
            }
        }
    }
}
