use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};

use strand_core::config::{McpServerConfig, McpTransport};
use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;

use crate::bridge::McpBridgedTool;
use crate::handler::StrandClientHandler;

type McpConnection = RunningService<RoleClient, StrandClientHandler>;

/// Connections to the MCP servers used by a single agent loop.
///
/// Opened before the first model call and closed once the loop reaches a
/// terminal state. Servers that fail to connect are logged and skipped.
pub struct McpSession {
    connections: Mutex<HashMap<String, McpConnection>>,
    timeouts: HashMap<String, u64>,
}

impl McpSession {
    /// A session with no servers.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            timeouts: HashMap::new(),
        })
    }

    /// Connect to each named server found in `servers`.
    pub async fn open(servers: &HashMap<String, McpServerConfig>, names: &[String]) -> Arc<Self> {
        let mut connections = HashMap::new();
        let mut timeouts = HashMap::new();

        for name in names {
            let Some(config) = servers.get(name) else {
                warn!(server = %name, "MCP server is not configured, skipping");
                continue;
            };
            match connect(name, config).await {
                Ok(conn) => {
                    info!(server = %name, "MCP server connected");
                    connections.insert(name.clone(), conn);
                    timeouts.insert(name.clone(), config.timeout_secs);
                }
                Err(e) => warn!(server = %name, error = %e, "MCP server failed to connect, skipping"),
            }
        }

        Arc::new(Self {
            connections: Mutex::new(connections),
            timeouts,
        })
    }

    /// Names of the connected servers.
    pub async fn servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tools offered by every connected server, bridged to local tool objects.
    /// A server whose tool listing fails contributes nothing.
    pub async fn tools(self: &Arc<Self>) -> Vec<Arc<dyn Tool>> {
        let conns = self.connections.lock().await;
        let mut bridged: Vec<Arc<dyn Tool>> = Vec::new();

        for (server, client) in conns.iter() {
            let tools = match client.list_all_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %server, error = %e, "Failed to list MCP tools");
                    continue;
                }
            };
            debug!(server = %server, count = tools.len(), "Listed MCP tools");

            let timeout = self.timeouts.get(server).copied().unwrap_or(120);
            for tool in tools {
                let description = tool
                    .description
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| format!("MCP tool: {}", tool.name));
                let schema = serde_json::to_value(&*tool.input_schema)
                    .unwrap_or(serde_json::json!({"type": "object"}));

                bridged.push(Arc::new(McpBridgedTool::new(
                    server,
                    &tool.name,
                    description,
                    schema,
                    timeout,
                    self.clone(),
                )));
            }
        }
        bridged
    }

    /// Call a tool on a connected server. Text content blocks are joined by newlines.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<String> {
        let conns = self.connections.lock().await;
        let client = conns
            .get(server_name)
            .ok_or_else(|| StrandError::Mcp(format!("Server '{}' not connected", server_name)))?;

        let params = CallToolRequestParams {
            name: tool_name.to_string().into(),
            arguments,
            meta: None,
            task: None,
        };

        let result = client.call_tool(params).await.map_err(|e| {
            StrandError::Mcp(format!("Tool call '{}.{}' failed: {}", server_name, tool_name, e))
        })?;

        let content: Vec<String> = result
            .content
            .iter()
            .map(|c| match c.raw {
                RawContent::Text(ref t) => t.text.to_string(),
                _ => format!("{:?}", c.raw),
            })
            .collect();

        Ok(content.join("\n"))
    }

    /// Close every connection. Safe to call more than once.
    pub async fn close(&self) {
        let mut conns = self.connections.lock().await;
        for (name, mut client) in conns.drain() {
            if let Err(e) = client.close().await {
                warn!(server = %name, error = %e, "MCP server did not close cleanly");
            } else {
                info!(server = %name, "MCP server disconnected");
            }
        }
    }
}

async fn connect(name: &str, config: &McpServerConfig) -> Result<McpConnection> {
    let handler = StrandClientHandler::new(name);

    match &config.transport {
        McpTransport::Stdio { command, args, env } => {
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }

            let transport = rmcp::transport::TokioChildProcess::new(cmd)
                .map_err(|e| StrandError::Mcp(format!("Failed to spawn {}: {}", command, e)))?;

            handler
                .serve(transport)
                .await
                .map_err(|e| StrandError::Mcp(format!("MCP init for '{}' failed: {}", name, e)))
        }
        McpTransport::Sse { url } => {
            let transport = StreamableHttpClientTransport::from_uri(url.as_str());

            <StrandClientHandler as ServiceExt<RoleClient>>::serve(handler, transport)
                .await
                .map_err(|e| StrandError::Mcp(format!("MCP init for '{}' failed: {}", name, e)))
        }
    }
}
