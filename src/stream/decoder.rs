use crate::protocol::upstream::UpstreamStreamChunk;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    ContentDelta(String),
    StreamEnd,
    Ignored,
}

/// Decode a single framed line from the upstream body.
///
/// Anything that is not a `data: ` line, malformed JSON, and payloads
/// without content all decode to [`UpstreamEvent::Ignored`]; the upstream
/// emits keep-alive noise, so none of these are errors.
#[must_use]
pub fn decode_line(line: &str) -> UpstreamEvent {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return UpstreamEvent::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return UpstreamEvent::StreamEnd;
    }

    match serde_json::from_str::<UpstreamStreamChunk>(payload) {
        Ok(chunk) => chunk
            .into_content()
            .map_or(UpstreamEvent::Ignored, UpstreamEvent::ContentDelta),
        Err(e) => {
            tracing::trace!(error = %e, "dropping undecodable upstream line");
            UpstreamEvent::Ignored
        }
    }
}
