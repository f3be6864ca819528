use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{json, Value};
use tracing::debug;

use strand_core::error::{Result, StrandError};

use crate::graph::config::HttpNodeConfig;
use crate::resolver::{resolve, resolve_deep};
use crate::state::ExecutionState;

use super::{NodeContext, NodeOutcome};

/// Any response, whatever its status, completes the node; only transport
/// failures are errors (and therefore retryable).
pub(super) async fn execute(
    ctx: &NodeContext<'_>,
    config: &HttpNodeConfig,
    state: &ExecutionState,
) -> Result<NodeOutcome> {
    let url = resolve(&config.url, state);
    if url.trim().is_empty() {
        return Err(StrandError::Config(format!(
            "http-request node '{}': url is empty",
            ctx.node.id
        )));
    }

    let timeout = config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.services.http_timeout);
    let mut request = ctx
        .services
        .http
        .request(config.method.as_reqwest(), &url)
        .timeout(timeout);
    for (name, value) in &config.headers {
        let (name, value) = header(ctx, name, &resolve(value, state))?;
        request = request.header(name, value);
    }

    if config.method.carries_body() {
        request = match &config.body {
            Value::Null => request,
            Value::String(s) if s.trim().is_empty() => request,
            Value::String(s) => request.body(resolve(s, state)),
            other => request.json(&resolve_deep(other, state)),
        };
    }

    debug!(node_id = %ctx.node.id, method = config.method.as_str(), %url, "Sending request");
    let response = request
        .send()
        .await
        .map_err(|e| StrandError::Http(format!("{} {}: {}", config.method.as_str(), url, e)))?;
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| StrandError::Http(format!("reading response from {}: {}", url, e)))?;
    let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));

    Ok(NodeOutcome::new(json!({
        "status_code": status,
        "text": text,
        "body": body,
    })))
}

/// A header that reqwest would reject at send time is a graph error, not a
/// transport one.
fn header(ctx: &NodeContext<'_>, name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let invalid = |what: &str| {
        StrandError::Config(format!(
            "http-request node '{}': invalid header {} '{}'",
            ctx.node.id, what, name
        ))
    };
    let header_name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid("name"))?;
    let header_value = HeaderValue::from_str(value).map_err(|_| invalid("value for"))?;
    Ok((header_name, header_value))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::super::test_support::{no_llm, state_with, Harness};

    /// Serve one canned response and hand back the raw request text.
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let l = l.to_ascii_lowercase();
                            l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_post_json_body_and_parse_response() {
        let (base, server) = serve_once("200 OK", r#"{"ok":true}"#).await;
        let h = Harness::new(
            "http-request",
            json!({
                "url": format!("{}/items/{{{{id}}}}", base),
                "method": "post",
                "headers": {"X-Trace": "{{id}}"},
                "body": {"name": "{{name}}"}
            }),
            no_llm(),
        );
        let out = h
            .run("n", &state_with(json!({"id": 9, "name": "widget"})))
            .await
            .unwrap()
            .output;
        assert_eq!(out["status_code"], 200);
        assert_eq!(out["body"], json!({"ok": true}));
        assert_eq!(out["text"], r#"{"ok":true}"#);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /items/9 "));
        assert!(raw.to_ascii_lowercase().contains("x-trace: 9"));
        assert!(raw.ends_with(r#"{"name":"widget"}"#));
    }

    #[tokio::test]
    async fn test_error_status_still_completes() {
        let (base, _server) = serve_once("404 Not Found", "missing").await;
        let h = Harness::new("http", json!({"url": base}), no_llm());
        let out = h.run("n", &state_with(json!({}))).await.unwrap().output;
        assert_eq!(out["status_code"], 404);
        assert_eq!(out["body"], "missing");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let h = Harness::new("http-request", json!({"url": format!("http://{}/", addr)}), no_llm());
        let err = h.run("n", &state_with(json!({}))).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_empty_url_is_configuration_error() {
        let h = Harness::new("http-request", json!({"url": ""}), no_llm());
        let err = h.run("n", &state_with(json!({}))).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_invalid_header_is_configuration_error() {
        let (base, _server) = serve_once("200 OK", "{}").await;
        let h = Harness::new(
            "http-request",
            json!({"url": base, "headers": {"bad header": "x"}}),
            no_llm(),
        );
        let err = h.run("n", &state_with(json!({}))).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(!err.is_transport());
        assert!(err.to_string().contains("bad header"));

        let h = Harness::new(
            "http-request",
            json!({"url": base, "headers": {"X-Note": "{{note}}"}}),
            no_llm(),
        );
        let err = h
            .run("n", &state_with(json!({"note": "line one\nline two"})))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
