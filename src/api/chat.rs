use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::auth::extract_bearer_key;
use crate::error::ProxyError;
use crate::observability::log_request_complete;
use crate::observability::token_counter::estimate_completion_usage;
use crate::protocol::openai::{
    ChatCompletion, ChatMessage, CompletionChoice, CompletionRequest, Role,
};
use crate::state::AppState;
use crate::stream::{drive, BufferedSink, LineStream, LiveSink, ResponseMeta, Transcoder};
use crate::upstream::{translate, TranslatedRequest};
use crate::util::unix_now_secs;

use super::sse_ok_response;

pub const GET_MODEL_DEFAULT: &str = "gpt-3.5-turbo";
pub const MISSING_MESSAGE_PARAM: &str = "Message parameter is required for GET requests.";

/// `POST /v1/chat/completions`.
pub async fn handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    match handle_post(&state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_post(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ProxyError> {
    let api_key = extract_bearer_key(headers)?;
    let request: CompletionRequest = serde_json::from_slice(body)
        .map_err(|err| ProxyError::InvalidRequest(format!("Invalid request body: {err}")))?;
    complete(state, api_key, request).await
}

/// `GET /v1/chat/completions?message=&model=&stream=`.
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Option<&str>,
) -> Response {
    let result = match parse_get_query(query) {
        Ok(request) => match extract_bearer_key(&headers) {
            Ok(api_key) => complete(&state, api_key, request).await,
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

/// Build the single-message request for the GET route.
///
/// `stream` is only enabled by the literal value `true`.
///
/// # Errors
///
/// Returns `ProxyError::InvalidRequest` when `message` is absent or empty.
pub fn parse_get_query(query: Option<&str>) -> Result<CompletionRequest, ProxyError> {
    let mut message = None;
    let mut model = None;
    let mut stream = false;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match &*key {
            "message" if message.is_none() => message = Some(value.into_owned()),
            "model" if model.is_none() => model = Some(value.into_owned()),
            "stream" => stream = value == "true",
            _ => {}
        }
    }

    let message = message
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest(MISSING_MESSAGE_PARAM.to_string()))?;
    let model = model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| GET_MODEL_DEFAULT.to_string());
    Ok(CompletionRequest::single_user_message(model, message, stream))
}

async fn complete(
    state: &Arc<AppState>,
    api_key: &str,
    request: CompletionRequest,
) -> Result<Response, ProxyError> {
    let start = Instant::now();
    let translated = translate(request, &state.config.defaults, &state.aliases)?;
    log_translated(&translated);

    let upstream_response = state.upstream.open_stream(api_key, &translated.body).await?;
    let meta = ResponseMeta {
        id: state.next_completion_id(),
        created: unix_now_secs(),
        model: translated.public_model,
    };
    let lines = LineStream::new(upstream_response.bytes_stream());

    if translated.wants_stream {
        Ok(stream_response(lines, meta))
    } else {
        buffered_response(lines, meta, start).await
    }
}

fn log_translated(translated: &TranslatedRequest) {
    tracing::info!(
        model = %translated.public_model,
        upstream_model = %translated.body.model,
        messages = translated.body.messages.len(),
        requested_stream = translated.wants_stream,
        upstream_stream = translated.body.stream,
        temperature = translated.body.temperature,
        max_tokens = translated.body.max_tokens,
        "chat completion request"
    );
    if !translated.ignored_params.is_empty() {
        tracing::info!(
            params = ?translated.ignored_params,
            "ignoring parameters the upstream does not support"
        );
    }
}

fn stream_response<L>(lines: L, meta: ResponseMeta) -> Response
where
    L: futures_util::Stream<Item = reqwest::Result<String>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let watcher = tx.clone();
    let transcoder = Transcoder::new(LiveSink::new(tx, meta));

    tokio::spawn(async move {
        let disconnect = async move { watcher.closed().await };
        let transcoder = drive(transcoder, lines, disconnect).await;
        tracing::debug!(state = ?transcoder.state(), "stream closed");
    });

    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<Bytes, Infallible>));
    sse_ok_response(body)
}

async fn buffered_response<L>(
    lines: L,
    meta: ResponseMeta,
    start: Instant,
) -> Result<Response, ProxyError>
where
    L: futures_util::Stream<Item = reqwest::Result<String>>,
{
    let transcoder = drive(
        Transcoder::new(BufferedSink::new()),
        lines,
        std::future::pending::<()>(),
    )
    .await;
    let content = transcoder.into_sink().into_content()?;
    let usage = estimate_completion_usage(&content);
    log_request_complete(&meta.model, &usage, start);

    let completion = ChatCompletion {
        id: meta.id,
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model,
        choices: vec![CompletionChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content,
            },
            finish_reason: "stop".to_string(),
        }],
        usage,
    };
    Ok(Json(completion).into_response())
}
