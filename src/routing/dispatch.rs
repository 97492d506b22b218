use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{self, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{chat, health, index, models};
use crate::error::LoggedError;
use crate::observability::request_log::redact_headers;
use crate::observability::RequestLogRecord;
use crate::state::AppState;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const CORS_ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Authorization, Content-Type";

/// Peer address of the accepted connection, attached by the server loop.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

enum RouteMatch {
    Index,
    Health,
    Models,
    ChatPost,
    ChatGet,
    Preflight,
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let cors = state.config.server.cors_allow_any_origin;
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref(), cors);
    let mut logged_body = None;

    let mut response = match route {
        RouteMatch::Index => index::index_handler(&parts.headers).into_response(),
        RouteMatch::Health => health::health_handler(State(state.clone())).into_response(),
        RouteMatch::Models => models::handler(State(state.clone())).into_response(),
        RouteMatch::ChatPost => {
            match read_request_body(body, state.config.server.body_limit_bytes).await {
                Ok(bytes) => {
                    if state.config.features.log_request_bodies {
                        logged_body = Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                    chat::handler(State(state.clone()), parts.headers.clone(), bytes).await
                }
                Err(response) => response,
            }
        }
        RouteMatch::ChatGet => {
            chat::get_handler(State(state.clone()), parts.headers.clone(), parts.uri.query())
                .await
        }
        RouteMatch::Preflight => preflight_response(),
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    if cors {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }

    let client_ip = client_ip(
        &parts.headers,
        parts.extensions.get::<ClientAddr>(),
        state.config.server.trust_forwarded_headers,
    );
    state.log_sink().record(RequestLogRecord {
        request_id: state.next_request_id(),
        client_ip,
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: redact_headers(&parts.headers),
        body: logged_body,
        status: response.status().as_u16(),
        response_time_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        error: response
            .extensions()
            .get::<LoggedError>()
            .map(|logged| logged.0.clone()),
    });

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body, limit: usize) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, limit).await.map_err(|_| {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Request body too large (max {limit} bytes)"),
        )
            .into_response()
    })
}

fn preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    response
}

fn client_ip(
    headers: &HeaderMap,
    peer: Option<&ClientAddr>,
    trust_forwarded: bool,
) -> Option<String> {
    if trust_forwarded {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }
    }
    peer.map(|addr| addr.0.ip().to_string())
}

fn match_route(method: &Method, path: &str, base_path: &str, cors: bool) -> RouteMatch {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    let known = matches!(path, "/" | "/health" | "/v1/models" | "/v1/chat/completions");
    if !known {
        return RouteMatch::NotFound;
    }
    if cors && method == Method::OPTIONS {
        return RouteMatch::Preflight;
    }

    match (path, method) {
        ("/", &Method::GET) => RouteMatch::Index,
        ("/health", &Method::GET) => RouteMatch::Health,
        ("/v1/models", &Method::GET) => RouteMatch::Models,
        ("/v1/chat/completions", &Method::POST) => RouteMatch::ChatPost,
        ("/v1/chat/completions", &Method::GET) => RouteMatch::ChatGet,
        _ => RouteMatch::MethodNotAllowed,
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}
