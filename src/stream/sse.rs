//! Outbound SSE frame encoding.

use crate::protocol::openai::{ErrorBody, ErrorPayload};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

const STREAM_ERROR_TYPE: &str = "stream_error";

/// Format a data-only SSE frame around an already serialised JSON payload.
#[must_use]
pub fn sse_data_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// In-band error frame sent once headers are already on the wire.
#[must_use]
pub fn error_frame(message: &str) -> String {
    let payload = ErrorPayload {
        error: ErrorBody {
            message: message.to_owned(),
            type_: STREAM_ERROR_TYPE.to_owned(),
            details: None,
        },
    };
    match serde_json::to_string(&payload) {
        Ok(json) => sse_data_frame(&json),
        Err(_) => sse_data_frame(r#"{"error":{"message":"stream error","type":"stream_error"}}"#),
    }
}
