//! Settings loading: defaults, then the JSON file, then `GREETER_*`
//! environment variables.
//!
//! Merge rules for the file layer:
//! - objects merge per key, recursively
//! - arrays and primitives from the file replace the default
//! - `null` in the file keeps the default

use std::path::{Path, PathBuf};

use greeter_core::logging::LogFormat;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::GreeterSettings;

/// Bounds applied to numeric overrides.
const TICK_INTERVAL_MS_RANGE: (u64, u64) = (1, 3_600_000);
const MAX_FRAME_LENGTH_RANGE: (usize, usize) = (1, 64 * 1024 * 1024);
const ACCEPT_BACKLOG_RANGE: (usize, usize) = (1, 65_535);

/// `~/.greeter/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".greeter").join("settings.json")
}

/// Load from [`settings_path`] and apply environment overrides.
pub fn load_settings() -> Result<GreeterSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` and apply environment overrides.
///
/// A missing file yields defaults. Unreadable or malformed files, and values
/// that cannot be served (a zero tick interval, an empty listen address), are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<GreeterSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<GreeterSettings> {
    let defaults = serde_json::to_value(GreeterSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Merge `source` over `target` following the file-layer rules.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut merged), Value::Object(overrides)) => {
            for (key, value) in overrides {
                if value.is_null() {
                    continue;
                }
                let value = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, source) => source,
    }
}

/// Apply `GREETER_*` variables from the process environment.
pub fn apply_env_overrides(settings: &mut GreeterSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides looked up through `lookup`.
///
/// Empty values are ignored. Values that fail to parse or fall outside their
/// range are logged and ignored.
pub fn apply_overrides_from(
    settings: &mut GreeterSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("GREETER_LISTEN_ADDRESS") {
        settings.server.listen_address = v;
    }
    if let Some(v) = read("GREETER_TICK_INTERVAL_MS") {
        let (min, max) = TICK_INTERVAL_MS_RANGE;
        if let Some(ms) = checked("GREETER_TICK_INTERVAL_MS", &v, parse_u64_range(&v, min, max)) {
            settings.server.tick_interval_ms = ms;
        }
    }
    if let Some(v) = read("GREETER_MAX_FRAME_LENGTH") {
        let (min, max) = MAX_FRAME_LENGTH_RANGE;
        if let Some(n) = checked("GREETER_MAX_FRAME_LENGTH", &v, parse_usize_range(&v, min, max)) {
            settings.server.max_frame_length = n;
        }
    }
    if let Some(v) = read("GREETER_ACCEPT_BACKLOG") {
        let (min, max) = ACCEPT_BACKLOG_RANGE;
        if let Some(n) = checked("GREETER_ACCEPT_BACKLOG", &v, parse_usize_range(&v, min, max)) {
            settings.server.accept_backlog = n;
        }
    }
    if let Some(v) = read("GREETER_GREETING_PREFIX") {
        settings.server.greeting_prefix = v;
    }
    if let Some(v) = read("GREETER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("GREETER_LOG_FORMAT") {
        if let Some(format) = checked("GREETER_LOG_FORMAT", &v, parse_log_format(&v)) {
            settings.logging.format = format;
        }
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env override, ignoring");
    }
    parsed
}

/// Reject settings the server cannot start with.
pub fn validate(settings: &GreeterSettings) -> Result<()> {
    if settings.server.listen_address.trim().is_empty() {
        return Err(SettingsError::InvalidValue(
            "server.listenAddress must not be empty".into(),
        ));
    }
    if settings.server.tick_interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "server.tickIntervalMs must be positive".into(),
        ));
    }
    if settings.server.max_frame_length == 0 {
        return Err(SettingsError::InvalidValue(
            "server.maxFrameLength must be positive".into(),
        ));
    }
    Ok(())
}

/// Parse a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse `compact` or `json`, case-insensitively.
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.trim().to_ascii_lowercase().as_str() {
        "compact" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}
