use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use strand_core::error::Result;
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolResult};

use crate::client::McpSession;

/// A tool served by a remote MCP server.
///
/// It keeps the server's own tool name so the model sees the same name the
/// server advertises; [`Tool::remote_server`] reports where it lives.
pub struct McpBridgedTool {
    server_name: String,
    tool_name: String,
    description: String,
    schema: serde_json::Value,
    timeout: u64,
    session: Arc<McpSession>,
}

impl McpBridgedTool {
    pub fn new(
        server_name: &str,
        tool_name: &str,
        description: String,
        schema: serde_json::Value,
        timeout: u64,
        session: Arc<McpSession>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            description,
            schema,
            timeout,
            session,
        }
    }
}

impl Tool for McpBridgedTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let arguments = input.as_object().cloned();

            debug!(server = %self.server_name, tool = %self.tool_name, "Calling MCP tool");

            match self.session.call_tool(&self.server_name, &self.tool_name, arguments).await {
                Ok(content) => Ok(ToolResult::success(content)),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout
    }

    fn remote_server(&self) -> Option<&str> {
        Some(&self.server_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::types::RunId;

    #[tokio::test]
    async fn test_bridged_tool_reports_server() {
        let tool = McpBridgedTool::new(
            "search",
            "lookup",
            "Look things up".to_string(),
            serde_json::json!({"type": "object"}),
            10,
            McpSession::empty(),
        );
        assert_eq!(tool.name(), "lookup");
        assert_eq!(tool.remote_server(), Some("search"));
        assert_eq!(tool.timeout_secs(), 10);

        // The session has no connection for this server; the failure is
        // reported as an error result rather than propagated.
        let result = tool
            .execute(serde_json::json!({"q": "x"}), ToolContext::new(RunId::new()))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("not connected"));
    }
}
