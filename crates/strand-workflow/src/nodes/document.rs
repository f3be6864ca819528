use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Value};
use tracing::{debug, warn};

use strand_tools::builtin::strip_html_tags;

use crate::graph::config::DocumentConfig;
use crate::resolver::{find_variable, value_to_text};
use crate::state::ExecutionState;

use super::NodeOutcome;

/// The variable may hold `{content}`, `{path}`, a path to an existing file,
/// or the text itself.
pub(super) async fn execute(config: &DocumentConfig, state: &ExecutionState) -> NodeOutcome {
    let input = find_variable(&config.variable, state)
        .filter(|v| !is_blank(v))
        .or_else(|| state.inputs.get("file").cloned())
        .unwrap_or(Value::Null);

    let text = match input {
        Value::Null => String::new(),
        Value::Object(file) => match (file.get("content"), file.get("path")) {
            (Some(content), _) => value_to_text(content),
            (None, Some(path)) => read_file(&value_to_text(path)).await,
            (None, None) => String::new(),
        },
        Value::String(s) => {
            if !s.is_empty() && Path::new(&s).is_file() {
                read_file(&s).await
            } else {
                s
            }
        }
        other => value_to_text(&other),
    };

    let length = text.chars().count();
    NodeOutcome::new(json!({"text": text, "length": length}))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

async fn read_file(path: &str) -> String {
    debug!(path, "Extracting document text");
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path, error = %e, "Document read failed");
            return format!("[File extraction failed: {}]", e);
        }
    };
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let extracted = match extension.as_deref() {
        Some("pdf") => binary(bytes, extract_pdf).await,
        Some("docx") => binary(bytes, extract_docx).await,
        Some("html") | Some("htm") => Ok(strip_html_tags(&String::from_utf8_lossy(&bytes))),
        _ => Ok(String::from_utf8_lossy(&bytes).into_owned()),
    };
    extracted.unwrap_or_else(|e| {
        warn!(path, error = %e, "Document extraction failed");
        format!("[File extraction failed: {}]", e)
    })
}

/// Parsers for binary formats are synchronous and may panic on malformed
/// input, so they run on the blocking pool.
async fn binary(bytes: Vec<u8>, extract: fn(&[u8]) -> Result<String, String>) -> Result<String, String> {
    tokio::task::spawn_blocking(move || extract(&bytes))
        .await
        .map_err(|e| format!("extractor aborted: {}", e))?
}

fn extract_pdf(bytes: &[u8]) -> Result<String, String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map(|text| text.trim().to_string())
        .map_err(|e| format!("pdf: {}", e))
}

/// Paragraph text of `word/document.xml`, one paragraph per line.
fn extract_docx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("docx: {}", e))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| format!("docx: {}", e))?
        .read_to_string(&mut xml)
        .map_err(|e| format!("docx: {}", e))?;

    let mut reader = Reader::from_str(&xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:tab" => current.push('\t'),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:br" => current.push('\n'),
            Ok(Event::Text(t)) if in_text => {
                current.push_str(&t.unescape().map_err(|e| format!("docx: {}", e))?);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    let line = current.trim();
                    if !line.is_empty() {
                        paragraphs.push(line.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("docx: {}", e)),
            _ => {}
        }
    }
    Ok(paragraphs.join("\n"))
}
