use crate::config::DefaultsConfig;
use crate::error::ProxyError;
use crate::protocol::openai::CompletionRequest;
use crate::protocol::upstream::UpstreamChatRequest;
use crate::routing::ModelAliases;

pub const MISSING_MESSAGES_MESSAGE: &str =
    "Messages parameter is required and must be a non-empty array.";

/// An inbound request mapped onto the upstream wire shape.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub body: UpstreamChatRequest,
    /// Model name echoed back to the caller (never the upstream alias).
    pub public_model: String,
    pub wants_stream: bool,
    /// OpenAI parameters that were accepted but have no upstream equivalent.
    pub ignored_params: Vec<String>,
}

/// Translate a caller request into an upstream request.
///
/// The upstream body always asks for streaming, whatever the caller wanted.
///
/// # Errors
///
/// Returns `ProxyError::InvalidRequest` when `messages` is missing or empty.
pub fn translate(
    request: CompletionRequest,
    defaults: &DefaultsConfig,
    aliases: &ModelAliases,
) -> Result<TranslatedRequest, ProxyError> {
    let wants_stream = request.wants_stream();
    let messages = match request.messages {
        Some(messages) if !messages.is_empty() => messages,
        _ => {
            return Err(ProxyError::InvalidRequest(
                MISSING_MESSAGES_MESSAGE.to_string(),
            ))
        }
    };

    let public_model = request
        .model
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| defaults.model.clone());
    let upstream_model = aliases.resolve(&public_model).to_string();

    let body = UpstreamChatRequest {
        model: upstream_model,
        messages,
        stream: true,
        temperature: request.temperature.unwrap_or(defaults.temperature),
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        top_p: request.top_p.unwrap_or(defaults.top_p),
        repetition_penalty: request
            .repetition_penalty
            .unwrap_or(defaults.repetition_penalty),
    };

    let mut ignored_params: Vec<String> = request.extra.into_iter().map(|(key, _)| key).collect();
    ignored_params.sort_unstable();

    Ok(TranslatedRequest {
        body,
        public_model,
        wants_stream,
        ignored_params,
    })
}
