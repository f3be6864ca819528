mod bridge;
mod client;
mod handler;

pub use bridge::McpBridgedTool;
pub use client::McpSession;
pub use handler::StrandClientHandler;
