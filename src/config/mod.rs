pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use self::validation::validate_config;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "STREAMFOLD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
/// Overrides `server.port` when set.
pub const PORT_ENV: &str = "PORT";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(default = "default_true")]
    pub cors_allow_any_origin: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_body_limit_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: String::new(),
            runtime_worker_threads: None,
            body_limit_bytes: default_body_limit_bytes(),
            trust_forwarded_headers: false,
            cors_allow_any_origin: true,
        }
    }
}

/// Connection settings for the streaming-only upstream.
///
/// There is deliberately no total request timeout: a slow upstream is only
/// ever cancelled by the client going away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_api_url() -> String {
    "https://www.gpt4novel.com/api/xiaoshuoai/ext/v1/chat/completions".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_pool_max_idle_per_host() -> usize {
    8
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            use_env_proxy: false,
            proxy: None,
        }
    }
}

/// Values used when a request leaves a parameter out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,
}

fn default_model() -> String {
    "nalang-xl-10".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u64 {
    800
}
fn default_top_p() -> f64 {
    0.35
}
fn default_repetition_penalty() -> f64 {
    1.05
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
        }
    }
}

fn default_model_aliases() -> BTreeMap<String, String> {
    [
        ("gpt-3.5-turbo", "nalang-turbo-v19"),
        ("gpt-3.5-turbo-16k", "nalang-xl-16k"),
        ("gpt-4", "nalang-xl-10"),
        ("gpt-4-32k", "nalang-xl-16k"),
        ("gpt-4-turbo", "nalang-v17-2"),
        ("gpt-4-turbo-preview", "nalang-v17-2"),
        ("nalang-xl-10", "nalang-xl-10"),
        ("nalang-xl-16k", "nalang-xl-16k"),
        ("nalang-v17-2", "nalang-v17-2"),
        ("nalang-turbo-v19", "nalang-turbo-v19"),
    ]
    .into_iter()
    .map(|(public, upstream)| (public.to_string(), upstream.to_string()))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_true")]
    pub log_request_bodies: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
            log_request_bodies: true,
        }
    }
}

/// Top-level application configuration. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default = "default_model_aliases")]
    pub model_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            defaults: DefaultsConfig::default(),
            model_aliases: default_model_aliases(),
            features: FeaturesConfig::default(),
        }
    }
}

/// Load and validate config from a YAML file.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Resolve the startup configuration.
///
/// An explicitly named file must load. Without one, `config.yaml` is used if
/// it exists and the built-in defaults otherwise. `port_override` replaces
/// the configured port.
///
/// # Errors
///
/// Returns [`ConfigError`] when the chosen file fails to load or the port
/// override is not a valid port number.
pub fn resolve_config(
    explicit_path: Option<&str>,
    port_override: Option<&str>,
) -> Result<AppConfig, ConfigError> {
    let mut config = match explicit_path {
        Some(path) => load_config(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_config(DEFAULT_CONFIG_PATH)?,
        None => {
            let config = AppConfig::default();
            validate_config(&config)?;
            config
        }
    };

    if let Some(port) = port_override {
        config.server.port = port.trim().parse().map_err(|_| {
            ConfigError::Validation(format!("{PORT_ENV} must be a valid port number, got {port:?}"))
        })?;
    }
    Ok(config)
}

/// [`resolve_config`] driven by `STREAMFOLD_CONFIG` and `PORT`.
///
/// # Errors
///
/// See [`resolve_config`].
pub fn load_config_from_env() -> Result<AppConfig, ConfigError> {
    let explicit = std::env::var(CONFIG_PATH_ENV).ok();
    let port = std::env::var(PORT_ENV).ok();
    resolve_config(explicit.as_deref(), port.as_deref())
}
