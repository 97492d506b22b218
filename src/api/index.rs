use axum::http::{header::HOST, HeaderMap};
use axum::response::Json;
use serde_json::{json, Value};

/// Self-describing API index served at the root path.
pub fn index_handler(headers: &HeaderMap) -> Json<Value> {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:3000");
    let example_curl = format!(
        "curl -X POST http://{host}/v1/chat/completions \\\n  \
         -H \"Content-Type: application/json\" \\\n  \
         -H \"Authorization: Bearer YOUR_API_KEY\" \\\n  \
         -d '{{\"model\": \"gpt-3.5-turbo\", \"messages\": [{{\"role\": \"user\", \"content\": \"Hello!\"}}], \"stream\": false}}'"
    );

    Json(json!({
        "name": "streamfold",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "OpenAI-compatible chat completions in front of a streaming-only API",
        "note": "The upstream only streams; non-streaming requests are buffered into a single completion",
        "endpoints": {
            "POST /v1/chat/completions": "Chat completions (OpenAI format)",
            "GET /v1/chat/completions": "Simple chat with query parameters (?message=...&model=...&stream=true)",
            "GET /v1/models": "List available models",
            "GET /health": "Health check",
        },
        "usage": {
            "authentication": "Bearer token in Authorization header",
            "example_curl": example_curl,
        },
    }))
}
