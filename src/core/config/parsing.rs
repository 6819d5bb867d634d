use std::env;
use std::time::Duration;

use super::types::{AiBackend, ConfigError, Environment};

pub(super) const MAX_WORKER_CONCURRENCY: usize = 8;
const DEFAULT_BACKOFF_SECONDS: u64 = 10;
const MAX_LEASE_SECONDS: u64 = 86_400;

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" || val == "stage" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_ai_backend(value: Option<String>) -> Result<AiBackend, ConfigError> {
    match value.as_deref().map(|item| item.to_ascii_lowercase()) {
        None => Ok(AiBackend::Stub),
        Some(ref val) if val == "stub" => Ok(AiBackend::Stub),
        Some(ref val) if val == "local" => Ok(AiBackend::Local),
        Some(other) => Err(ConfigError::InvalidValue { field: "AI_BACKEND", value: other }),
    }
}

/// Backoff is parsed leniently: a typo must not take the worker down.
pub(super) fn parse_backoff_seconds(value: Option<String>) -> u64 {
    let Some(raw) = value else {
        return DEFAULT_BACKOFF_SECONDS;
    };

    match raw.parse::<i64>() {
        Ok(parsed) => u64::try_from(parsed.max(1)).unwrap_or(1),
        Err(_) => {
            tracing::warn!(
                value = %raw,
                default = DEFAULT_BACKOFF_SECONDS,
                "Invalid WORKER_BACKOFF_SECONDS, using default"
            );
            DEFAULT_BACKOFF_SECONDS
        }
    }
}

pub(super) fn parse_poll_interval(
    field: &'static str,
    value: String,
) -> Result<Duration, ConfigError> {
    let parsed =
        value.parse::<f64>().map_err(|_| ConfigError::InvalidValue { field, value: value.clone() })?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(ConfigError::InvalidValue { field, value });
    }
    Duration::try_from_secs_f64(parsed).map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_lease_seconds(value: String) -> Result<u64, ConfigError> {
    let field = "WORKER_LEASE_SECONDS";
    let parsed = parse_u64(field, value)?;
    if !(1..=MAX_LEASE_SECONDS).contains(&parsed) {
        return Err(ConfigError::OutOfRange { field, value: parsed, min: 1, max: MAX_LEASE_SECONDS });
    }
    Ok(parsed)
}

pub(super) fn parse_concurrency(value: Option<String>) -> Result<usize, ConfigError> {
    let Some(raw) = value else {
        return Ok(1);
    };
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue { field: "WORKER_CONCURRENCY", value: raw.clone() })?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue { field: "WORKER_CONCURRENCY", value: raw });
    }
    if parsed > MAX_WORKER_CONCURRENCY {
        tracing::warn!(
            requested = parsed,
            max = MAX_WORKER_CONCURRENCY,
            "WORKER_CONCURRENCY capped"
        );
        return Ok(MAX_WORKER_CONCURRENCY);
    }
    Ok(parsed)
}

pub(super) fn parse_timeout_seconds(field: &'static str, value: String) -> Result<u64, ConfigError> {
    let parsed = parse_u64(field, value)?;
    if !(1..=300).contains(&parsed) {
        return Err(ConfigError::OutOfRange { field, value: parsed, min: 1, max: 300 });
    }
    Ok(parsed)
}

/// Model traffic must stay on the host or the compose network.
pub(super) fn validate_ollama_url(value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidValue { field: "OLLAMA_BASE_URL", value: value.to_string() };

    let parsed = reqwest::Url::parse(value).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid());
    }

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let local = host == "localhost"
        || host.starts_with("127.")
        || host == "::1"
        || (!host.is_empty() && host.chars().all(|c| c.is_ascii_alphabetic() || c == '-'));

    if local {
        Ok(())
    } else {
        Err(invalid())
    }
}
