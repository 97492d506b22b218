//! Per-request log records handed to a write-only sink.

use http::header::AUTHORIZATION;
use http::HeaderMap;

const REDACTED: &str = "[redacted]";
pub const REQUEST_LOG_TARGET: &str = "streamfold::request_log";

/// One finished request as seen by the log sink.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub client_ip: Option<String>,
    pub method: String,
    pub path: String,
    /// Header name/value pairs with credentials already redacted.
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub status: u16,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Write-only request log. Implementations must not block and cannot fail
/// the request; anything that goes wrong stays inside the sink.
pub trait RequestLogSink: Send + Sync {
    fn record(&self, record: RequestLogRecord);
}

/// Default sink: one structured tracing event per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl RequestLogSink for TracingLogSink {
    fn record(&self, record: RequestLogRecord) {
        let headers = serde_json::to_string(&record.headers).unwrap_or_default();
        tracing::info!(
            target: REQUEST_LOG_TARGET,
            request_id = %record.request_id,
            client_ip = record.client_ip.as_deref().unwrap_or("-"),
            method = %record.method,
            path = %record.path,
            status = record.status,
            response_time_ms = record.response_time_ms,
            headers = %headers,
            body = record.body.as_deref().unwrap_or(""),
            error = record.error.as_deref().unwrap_or(""),
            "request"
        );
    }
}

/// Copy request headers for logging, redacting the caller's credential.
#[must_use]
pub fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if name == AUTHORIZATION {
                REDACTED.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}
