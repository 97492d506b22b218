mod request_id;

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::observability::{RequestLogSink, TracingLogSink};
use crate::routing::ModelAliases;
use crate::upstream::UpstreamClient;
use crate::util::unix_now_secs;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
///
/// Built once at startup; nothing in it changes afterwards.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    pub aliases: ModelAliases,
    log_sink: Arc<dyn RequestLogSink>,
    request_ids: RequestIdGenerator,
    started_at: Instant,
    started_unix_secs: u64,
}

impl AppState {
    /// Build state with the default tracing log sink.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Internal` when the upstream client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, ProxyError> {
        Self::with_log_sink(config, Arc::new(TracingLogSink))
    }

    /// # Errors
    ///
    /// Returns `ProxyError::Internal` when the upstream client cannot be built.
    pub fn with_log_sink(
        config: AppConfig,
        log_sink: Arc<dyn RequestLogSink>,
    ) -> Result<Self, ProxyError> {
        let upstream = UpstreamClient::new(&config.upstream)?;
        let aliases = ModelAliases::new(&config);
        Ok(Self {
            config,
            upstream,
            aliases,
            log_sink,
            request_ids: RequestIdGenerator::new(),
            started_at: Instant::now(),
            started_unix_secs: unix_now_secs(),
        })
    }

    #[must_use]
    pub fn log_sink(&self) -> &dyn RequestLogSink {
        &*self.log_sink
    }

    /// Fresh `chatcmpl-…` id for one response.
    #[must_use]
    pub fn next_completion_id(&self) -> String {
        self.request_ids.completion_id()
    }

    /// Id used to correlate a request with its log record.
    #[must_use]
    pub fn next_request_id(&self) -> String {
        let seq = self.request_ids.next_seq();
        self.request_ids.request_uuid(seq).to_string()
    }

    #[must_use]
    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Process start time, used as the `created` stamp of listed models.
    #[must_use]
    pub fn started_unix_secs(&self) -> u64 {
        self.started_unix_secs
    }
}
