use chrono::{FixedOffset, Local, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolResult};

const DEFAULT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct DateTimeTool;

#[derive(Deserialize)]
struct DateTimeInput {
    /// Offset from UTC in hours, e.g. 8 or -5.5.
    #[serde(default)]
    utc_offset_hours: Option<f64>,
    #[serde(default)]
    format: Option<String>,
}

impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally shift to a UTC offset and apply a strftime format."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "number",
                    "description": "Hours east of UTC (default: local time)"
                },
                "format": {
                    "type": "string",
                    "description": "strftime format string (default: %Y-%m-%d %H:%M:%S)"
                }
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: DateTimeInput = serde_json::from_value(input)
                .map_err(|e| StrandError::ToolValidation(e.to_string()))?;

            let now = match params.utc_offset_hours {
                Some(hours) => {
                    let offset_secs = (hours * 3600.0).round() as i32;
                    let offset = FixedOffset::east_opt(offset_secs).ok_or_else(|| {
                        StrandError::ToolValidation(format!("UTC offset out of range: {}s", offset_secs))
                    })?;
                    Utc::now().with_timezone(&offset)
                }
                None => Local::now().fixed_offset(),
            };

            let fmt = params.format.as_deref().unwrap_or(DEFAULT_FORMAT);
            let mut text = String::new();
            use std::fmt::Write;
            write!(text, "{}", now.format(fmt))
                .map_err(|_| StrandError::ToolValidation(format!("Invalid format string: {}", fmt)))?;
            Ok(ToolResult::success(text))
        })
    }
}
