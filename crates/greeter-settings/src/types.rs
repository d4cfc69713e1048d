//! Settings schema.
//!
//! Every struct deserializes with `#[serde(default)]`, so a settings file
//! only needs the keys it changes.

use greeter_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Root settings object, as stored in `settings.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GreeterSettings {
    /// Listener, ticker and payload settings.
    pub server: ServerSettings,
    /// Subscriber settings.
    pub logging: LoggingSettings,
}

/// Listener, ticker and payload settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// `host:port` to listen on.
    pub listen_address: String,
    /// Broadcast period in milliseconds.
    pub tick_interval_ms: u64,
    /// Largest frame payload in bytes.
    pub max_frame_length: usize,
    /// Accepted connections held while no call is armed.
    pub accept_backlog: usize,
    /// First word of every greeting.
    pub greeting_prefix: String,
    /// Seconds the daemon waits for `run()` to return after stopping.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:50051".to_string(),
            tick_interval_ms: 100,
            max_frame_length: 4 * 1024 * 1024,
            accept_backlog: 128,
            greeting_prefix: "Hello".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

/// Subscriber settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
