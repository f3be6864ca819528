use futures::future::BoxFuture;
use serde::Deserialize;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolResult};

pub struct EchoTool;

#[derive(Deserialize)]
struct EchoInput {
    text: String,
}

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given text unchanged."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo back" }
            },
            "required": ["text"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: EchoInput = serde_json::from_value(input)
                .map_err(|e| StrandError::ToolValidation(e.to_string()))?;
            Ok(ToolResult::success(params.text))
        })
    }
}
