use crate::error::ProxyError;
use http::header::AUTHORIZATION;

pub const MISSING_KEY_MESSAGE: &str =
    "Missing API key. Please provide Authorization header with Bearer token.";

/// Extract the caller's bearer key from `Authorization: Bearer <key>`.
///
/// The proxy holds no credentials of its own; this key is forwarded upstream
/// verbatim. A missing header, a different scheme or an empty key all fail
/// before any upstream call is made.
///
/// # Errors
///
/// Returns `ProxyError::Authentication` when no usable bearer key is present.
pub fn extract_bearer_key(headers: &http::HeaderMap) -> Result<&str, ProxyError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ProxyError::Authentication(MISSING_KEY_MESSAGE.to_string()))
}
