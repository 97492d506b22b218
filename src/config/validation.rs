use super::{AppConfig, ConfigError};

const VALID_LOG_LEVELS: [&str; 6] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream_config(config)?;
    validate_defaults(config)?;
    validate_model_aliases(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.body_limit_bytes == 0 {
        return Err(validation_err("server.body_limit_bytes must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    validate_http_url("upstream.api_url", &upstream.api_url)?;
    if let Some(proxy) = upstream.proxy.as_deref() {
        if proxy.trim().is_empty() {
            return Err(validation_err("upstream.proxy cannot be empty when set"));
        }
        validate_http_url("upstream.proxy", proxy.trim())?;
    }
    if upstream.connect_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.connect_timeout_secs must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field_name} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_defaults(config: &AppConfig) -> Result<(), ConfigError> {
    let defaults = &config.defaults;
    if defaults.model.trim().is_empty() {
        return Err(validation_err("defaults.model cannot be empty"));
    }
    for (name, value) in [
        ("temperature", defaults.temperature),
        ("top_p", defaults.top_p),
        ("repetition_penalty", defaults.repetition_penalty),
    ] {
        if !value.is_finite() {
            return Err(validation_err(format!(
                "defaults.{name} must be a finite number"
            )));
        }
    }
    if defaults.max_tokens == 0 {
        return Err(validation_err("defaults.max_tokens must be greater than 0"));
    }
    Ok(())
}

fn validate_model_aliases(config: &AppConfig) -> Result<(), ConfigError> {
    for (public, upstream) in &config.model_aliases {
        if public.trim().is_empty() {
            return Err(validation_err("model_aliases contains an empty model name"));
        }
        if upstream.trim().is_empty() {
            return Err(validation_err(format!(
                "model_aliases.{public} maps to an empty upstream model"
            )));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {VALID_LOG_LEVELS:?}"
        )));
    }
    Ok(())
}
