use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;

use crate::protocol::openai::{ModelEntry, ModelList};
use crate::state::AppState;

pub const MODEL_OWNER: &str = "streamfold";

/// List every public model name from the alias table in `OpenAI` format.
pub fn handler(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let created = state.started_unix_secs();
    let data = state
        .aliases
        .public_names()
        .iter()
        .map(|name| ModelEntry {
            id: name.to_string(),
            object: "model".to_string(),
            created,
            owned_by: MODEL_OWNER.to_string(),
        })
        .collect();
    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}
