use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolResult};

const DEFAULT_MAX_CHARS: usize = 4000;

pub struct WebPageReaderTool;

#[derive(Deserialize)]
struct WebPageReaderInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

impl Tool for WebPageReaderTool {
    fn name(&self) -> &str {
        "web_page_reader"
    }

    fn timeout_secs(&self) -> u64 {
        30
    }

    fn description(&self) -> &str {
        "Read the main text of a web page. Strips scripts, styles and tags and returns plain text."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL of the page to read"
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum characters to return (default: 4000)"
                }
            },
            "required": ["url"]
        })
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: WebPageReaderInput = serde_json::from_value(input)
                .map_err(|e| StrandError::ToolValidation(e.to_string()))?;
            let max_length = params.max_length.unwrap_or(DEFAULT_MAX_CHARS);

            debug!(url = %params.url, "Reading web page");

            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .user_agent("Strand/0.1")
                .build()
                .map_err(|e| StrandError::ToolExecution {
                    tool: "web_page_reader".to_string(),
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            let resp = match client.get(&params.url).send().await {
                Ok(resp) => resp,
                Err(e) => return Ok(ToolResult::error(format!("Failed to read page: {}", e))),
            };

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolResult::error(format!(
                    "Failed to read page: HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => return Ok(ToolResult::error(format!("Failed to read page: {}", e))),
            };

            let text = strip_html_tags(&body);
            Ok(ToolResult::success(truncate_chars(&text, max_length)))
        })
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("invalid regex {pattern}: {e}")))
}

/// Strip HTML down to its visible text, one trimmed non-empty line per line.
pub fn strip_html_tags(html: &str) -> String {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static STYLE: OnceLock<Regex> = OnceLock::new();
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();

    let cleaned = regex(&SCRIPT, r"(?is)<script[^>]*>.*?</script>").replace_all(html, "");
    let cleaned = regex(&STYLE, r"(?is)<style[^>]*>.*?</style>").replace_all(&cleaned, "");
    // Block-level boundaries become line breaks before tags are dropped.
    let cleaned = regex(&BLOCK, r"(?i)<(br|/p|/div|/li|/h[1-6]|/tr)[^>]*>").replace_all(&cleaned, "\n");
    let text = regex(&TAG, r"<[^>]+>").replace_all(&cleaned, "");

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
