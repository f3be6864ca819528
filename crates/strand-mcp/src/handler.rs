use std::future::Future;

use tracing::{debug, warn};

use rmcp::handler::client::ClientHandler;
use rmcp::model::*;
use rmcp::service::{NotificationContext, RequestContext};
use rmcp::ErrorData as McpError;
use rmcp::RoleClient;

/// Client handler for one server connection.
///
/// Sessions are short-lived, so server notifications are only logged.
pub struct StrandClientHandler {
    server_name: String,
}

impl StrandClientHandler {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
        }
    }
}

#[allow(clippy::manual_async_fn)]
impl ClientHandler for StrandClientHandler {
    fn on_tool_list_changed(
        &self,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async {
            debug!(server = %self.server_name, "MCP tool list changed mid-session, ignoring");
        }
    }

    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            debug!(server = %self.server_name, level = ?params.level, "MCP log: {}", params.data);
        }
    }

    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _ctx: NotificationContext<RoleClient>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            debug!(
                server = %self.server_name,
                progress = params.progress,
                total = ?params.total,
                "MCP progress"
            );
        }
    }

    fn create_message(
        &self,
        _params: CreateMessageRequestParams,
        _ctx: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<CreateMessageResult, McpError>> + Send + '_ {
        async {
            warn!(server = %self.server_name, "Server requested sampling, which is not supported");
            Err(McpError::method_not_found::<CreateMessageRequestMethod>())
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "strand".into(),
                title: None,
                version: env!("CARGO_PKG_VERSION").into(),
                description: None,
                icons: None,
                website_url: None,
            },
        }
    }
}
