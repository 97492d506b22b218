use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns liveness, the current time as an HTTP date and process uptime in seconds.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": httpdate::fmt_http_date(SystemTime::now()),
        "uptime": state.uptime_secs(),
    }))
}
