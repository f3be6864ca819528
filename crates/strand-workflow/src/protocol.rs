use bytes::{BufMut, BytesMut};
use futures::{future, stream, Stream, StreamExt};
use serde::Serialize;
use tokio_util::codec::Encoder;
use tracing::warn;

use strand_agent::AgentEvent;
use strand_core::error::{Result, StrandError};

/// End-of-stream frame, sent whatever the outcome of the run.
pub const DONE_SENTINEL: &str = "data: [DONE]\n\n";

/// Frame one event.
pub fn encode<T: Serialize>(event: &T) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Frame an event stream and append the sentinel. Events that fail to
/// serialise are logged and dropped.
pub fn frames<S, T>(events: S) -> impl Stream<Item = String>
where
    S: Stream<Item = T>,
    T: Serialize,
{
    events
        .filter_map(|event| {
            future::ready(match encode(&event) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable event");
                    None
                }
            })
        })
        .chain(stream::once(future::ready(DONE_SENTINEL.to_string())))
}

/// Like [`frames`], but for agent events: persistence-only `message` events
/// never reach the wire.
pub fn agent_frames<S>(events: S) -> impl Stream<Item = String>
where
    S: Stream<Item = AgentEvent>,
{
    frames(events.filter(|e| future::ready(e.is_forwarded())))
}

/// [`Encoder`] producing the same frames, for use with `FramedWrite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SseEncoder;

impl<T: Serialize> Encoder<T> for SseEncoder {
    type Error = StrandError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 8);
        dst.put_slice(b"data: ");
        dst.put_slice(&json);
        dst.put_slice(b"\n\n");
        Ok(())
    }
}
