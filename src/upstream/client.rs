use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::protocol::upstream::UpstreamChatRequest;

fn build_reqwest_client(config: &UpstreamConfig) -> Result<reqwest::Client, ProxyError> {
    // Connect timeout only: a streaming generation may legitimately run for
    // minutes and is cancelled by client disconnect, not by a clock.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| ProxyError::Internal(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| ProxyError::Internal(format!("Failed to build HTTP client: {err}")))
}

/// Client for the streaming-only upstream. Every call is attempted exactly
/// once; a failed generation is surfaced, never repeated.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    api_url: String,
}

impl UpstreamClient {
    /// # Errors
    ///
    /// Returns `ProxyError::Internal` when the HTTP client cannot be built.
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        Ok(Self {
            http: build_reqwest_client(config)?,
            api_url: config.api_url.clone(),
        })
    }

    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// POST the request upstream and hand back the successful response,
    /// whose body is the event stream.
    ///
    /// The caller's key is forwarded verbatim as the upstream credential.
    /// Dropping the response (or its body stream) closes the upstream
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::UpstreamApi` for a non-success status (with the
    /// full upstream body), or `ProxyError::StreamTranscode` when the request
    /// could not be sent at all.
    pub async fn open_stream(
        &self,
        api_key: &str,
        body: &UpstreamChatRequest,
    ) -> Result<reqwest::Response, ProxyError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| ProxyError::Internal(format!("Failed to encode upstream body: {err}")))?;
        let response = self
            .http
            .post(&self.api_url)
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .body(payload)
            .send()
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "upstream request failed to send");
                ProxyError::StreamTranscode(err.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or_default().to_string();
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read upstream error body");
                    String::new()
                }
            };
            tracing::error!(
                status = status.as_u16(),
                body = %body,
                "upstream returned error status"
            );
            return Err(ProxyError::UpstreamApi {
                status: status.as_u16(),
                status_text,
                body,
            });
        }

        Ok(response)
    }
}
