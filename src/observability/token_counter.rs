use crate::protocol::openai::Usage;
use std::time::Duration;
use tracing::info;

/// Usage for a buffered completion.
///
/// No tokenizer is available, so completion tokens are the length of the
/// content in UTF-16 code units and prompt tokens are always reported as zero.
/// Characters outside the Basic Multilingual Plane count twice.
#[must_use]
pub fn estimate_completion_usage(content: &str) -> Usage {
    let completion_tokens = content.encode_utf16().count() as u64;
    Usage {
        prompt_tokens: 0,
        completion_tokens,
        total_tokens: completion_tokens,
    }
}

/// Log estimated usage for a completed request.
pub fn log_request_usage(model: &str, usage: &Usage, duration: Duration) {
    info!(
        model = model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        duration_ms = duration.as_millis() as u64,
        "request complete"
    );
}
