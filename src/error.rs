use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::protocol::openai::{ErrorBody, ErrorPayload};

/// Error raised anywhere in the request pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status} {status_text}")]
    UpstreamApi {
        status: u16,
        status_text: String,
        body: String,
    },
    #[error("Stream transcode error: {0}")]
    StreamTranscode(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    InvalidRequest,
    Upstream,
    Stream,
    Internal,
}

/// Error text attached to error responses so the request log can pick it up
/// after the body has been built.
#[derive(Debug, Clone)]
pub struct LoggedError(pub String);

impl ProxyError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxyError::Authentication(_) => ErrorCategory::Authentication,
            ProxyError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            ProxyError::UpstreamApi { .. } => ErrorCategory::Upstream,
            ProxyError::StreamTranscode(_) => ErrorCategory::Stream,
            ProxyError::Internal(_) => ErrorCategory::Internal,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamApi { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::StreamTranscode(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn error_type(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::Authentication => "authentication_error",
        ErrorCategory::InvalidRequest => "invalid_request_error",
        ErrorCategory::Upstream => "api_error",
        ErrorCategory::Stream | ErrorCategory::Internal => "server_error",
    }
}

/// Build the OpenAI-style error body for an error.
///
/// Internal errors never expose their cause; everything else carries the
/// full detail because nothing has been written to the client yet.
#[must_use]
pub fn error_payload(err: &ProxyError) -> ErrorPayload {
    let cat = err.category();
    let (message, details) = match err {
        ProxyError::Authentication(message) | ProxyError::InvalidRequest(message) => {
            (message.clone(), None)
        }
        ProxyError::UpstreamApi {
            status,
            status_text,
            body,
        } => (
            format!("API request failed: {status} {status_text}"),
            Some(body.clone()),
        ),
        ProxyError::StreamTranscode(cause) => (
            "Error processing stream response".to_string(),
            Some(cause.clone()),
        ),
        ProxyError::Internal(_) => ("Internal server error".to_string(), None),
    };

    ErrorPayload {
        error: ErrorBody {
            message,
            type_: error_type(cat).to_string(),
            details,
        },
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let ProxyError::Internal(cause) = &self {
            tracing::error!(error = %cause, "internal error");
        }
        let status = self.status();
        let mut response = (status, axum::Json(error_payload(&self))).into_response();
        response
            .extensions_mut()
            .insert(LoggedError(self.to_string()));
        response
    }
}
