use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::types::config::SupervisorConfig;

pub const CONFIG_PATH_ENV: &str = "FLEETWATCH_CONFIG";
pub const STREAM_URL_ENV: &str = "FLEETWATCH_STREAM_URL";
pub const BASE_INTERVAL_ENV: &str = "FLEETWATCH_BASE_INTERVAL_SECS";
pub const FAST_INTERVAL_ENV: &str = "FLEETWATCH_FAST_INTERVAL_SECS";

pub fn data_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".fleetwatch"))
        .ok_or_else(|| ConfigError::Invalid("could not determine home directory".into()))
}

/// `$FLEETWATCH_CONFIG` if set, otherwise `~/.fleetwatch/config.json`.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(data_dir()?.join("config.json")),
    }
}

/// Load, apply environment overrides and validate. A missing file yields
/// the defaults.
pub fn load_config(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file, using defaults");
            String::new()
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_config(&text, |key| std::env::var(key).ok())
}

/// Parse config text, then merge overrides read through `lookup`.
pub fn parse_config<F>(text: &str, lookup: F) -> Result<SupervisorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut value: Value = if text.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(text)?
    };
    let overrides = env_overrides(lookup)?;
    if overrides.as_object().is_some_and(|o| !o.is_empty()) {
        debug!(overrides = %overrides, "Applying environment overrides");
        merge_json(&mut value, &overrides);
    }
    let config: SupervisorConfig = serde_json::from_value(value)?;
    validate(&config)?;
    Ok(config)
}

pub fn env_overrides<F>(lookup: F) -> Result<Value, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut patch = json!({});
    if let Some(url) = lookup(STREAM_URL_ENV).filter(|u| !u.trim().is_empty()) {
        merge_json(&mut patch, &json!({ "stream": { "url": url.trim() } }));
    }
    for (key, field) in [
        (BASE_INTERVAL_ENV, "baseIntervalSecs"),
        (FAST_INTERVAL_ENV, "fastIntervalSecs"),
    ] {
        if let Some(raw) = lookup(key) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a whole number of seconds, got '{}'", key, raw))
            })?;
            merge_json(&mut patch, &json!({ "health": { field: secs } }));
        }
    }
    Ok(patch)
}

/// Deep-merge `patch` into `base`; objects merge key by key, anything
/// else replaces.
pub fn merge_json(base: &mut Value, patch: &Value) {
    if let (Value::Object(base_map), Value::Object(patch_map)) = (base, patch) {
        for (key, value) in patch_map {
            if value.is_object() && base_map.get(key).is_some_and(Value::is_object) {
                if let Some(existing) = base_map.get_mut(key) {
                    merge_json(existing, value);
                }
            } else {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

pub fn validate(config: &SupervisorConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Invalid(msg));

    let health = &config.health;
    if health.base_interval_secs == 0 || health.fast_interval_secs == 0 {
        return invalid("health intervals must be positive".into());
    }
    if health.fast_interval_secs >= health.base_interval_secs {
        return invalid(format!(
            "health.fastIntervalSecs ({}) must be shorter than health.baseIntervalSecs ({})",
            health.fast_interval_secs, health.base_interval_secs
        ));
    }
    if health.probe_timeout_secs == 0 {
        return invalid("health.probeTimeoutSecs must be positive".into());
    }

    if config.breaker.failure_threshold == 0 {
        return invalid("breaker.failureThreshold must be at least 1".into());
    }
    if config.breaker.cooldown_secs == 0 {
        return invalid("breaker.cooldownSecs must be positive".into());
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return invalid("retry.maxAttempts must be at least 1".into());
    }
    if !(retry.backoff_base > 1.0) || !retry.backoff_base.is_finite() {
        return invalid(format!(
            "retry.backoffBase must be greater than 1.0, got {}",
            retry.backoff_base
        ));
    }
    if retry.max_delay_ms < retry.initial_delay_ms {
        return invalid("retry.maxDelayMs must not be below retry.initialDelayMs".into());
    }
    if !(0.0..1.0).contains(&retry.jitter) {
        return invalid(format!("retry.jitter must be in [0, 1), got {}", retry.jitter));
    }

    if config.alerts.capacity == 0 {
        return invalid("alerts.capacity must be positive".into());
    }

    for (name, service) in &config.services {
        if name.trim().is_empty() {
            return invalid("service names must not be empty".into());
        }
        if service.port == 0 {
            return invalid(format!("service '{}' has port 0", name));
        }
    }

    if let Some(stream) = &config.stream {
        if stream.url.trim().is_empty() {
            return invalid("stream.url must not be empty".into());
        }
        if stream.reconnect_interval_secs == 0 {
            return invalid("stream.reconnectIntervalSecs must be positive".into());
        }
    }
    Ok(())
}
