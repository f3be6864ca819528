use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use strand_core::error::{Result, StrandError};

/// Incremental parser for `text/event-stream` bodies.
/// SSE format: `event: <type>\ndata: <json>\n\n`
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The OpenAI end-of-stream marker.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if line.starts_with(':') {
                    continue; // comment / keep-alive
                }
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// A stream of SSE events over a response body.
///
/// Bytes are buffered until they form valid UTF-8, so multi-byte characters
/// split across network chunks survive. A transport error ends the stream
/// with an `LlmStream` error.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: std::collections::VecDeque<SseEvent>,
    partial: Vec<u8>,
    finished: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: Default::default(),
            partial: Vec::new(),
            finished: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.partial.extend_from_slice(&bytes);
                    let valid_up_to = match std::str::from_utf8(&this.partial) {
                        Ok(_) => this.partial.len(),
                        Err(e) => e.valid_up_to(),
                    };
                    let complete: Vec<u8> = this.partial.drain(..valid_up_to).collect();
                    let text = String::from_utf8_lossy(&complete);
                    this.pending.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(StrandError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_basic() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message\ndata: {\"id\":\"x\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"id\":\"x\"}");
    }

    #[test]
    fn test_sse_parser_chunked_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"x\":").is_empty());
        let events = parser.feed("1}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"x\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_sse_parser_skips_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keep-alive\n\ndata:{\"y\":2}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"y\":2}");
    }
}
