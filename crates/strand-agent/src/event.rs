use serde::{Deserialize, Serialize};

/// A completed tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// One executed tool call and its string result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub name: String,
    pub args: serde_json::Value,
    pub result: String,
}

/// Events emitted by the agent loop, tagged by `event` on the wire.
///
/// `Message` events describe the conversation turns for persistence and are
/// not forwarded to callers. Every loop ends with exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A fragment of assistant text.
    Text { content: String },

    /// A tool is about to run.
    Trace {
        id: String,
        name: String,
        args: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        mcp_server: Option<String>,
    },

    /// A tool finished.
    TraceResult { id: String, result: String },

    /// A completed conversation turn.
    Message {
        role: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },

    Done,

    Error { content: String },
}

impl AgentEvent {
    /// Whether the event ends the loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done | AgentEvent::Error { .. })
    }

    /// Whether callers should see the event on the live stream.
    pub fn is_forwarded(&self) -> bool {
        !matches!(self, AgentEvent::Message { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let trace = AgentEvent::Trace {
            id: "call_1".into(),
            name: "calc".into(),
            args: serde_json::json!({"expression": "2+2"}),
            mcp_server: None,
        };
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["event"], "trace");
        assert_eq!(json["name"], "calc");
        assert!(json.get("mcp_server").is_none());

        let done = serde_json::to_value(AgentEvent::Done).unwrap();
        assert_eq!(done, serde_json::json!({"event": "done"}));

        let result = serde_json::to_value(AgentEvent::TraceResult {
            id: "call_1".into(),
            result: "4".into(),
        })
        .unwrap();
        assert_eq!(result["event"], "trace_result");
    }

    #[test]
    fn test_message_is_not_forwarded() {
        let msg = AgentEvent::Message {
            role: "assistant".into(),
            content: "hi".into(),
            tool_calls: vec![],
            name: None,
            tool_call_id: None,
        };
        assert!(!msg.is_forwarded());
        assert!(!msg.is_terminal());
        assert!(AgentEvent::Error { content: "x".into() }.is_terminal());
    }
}
