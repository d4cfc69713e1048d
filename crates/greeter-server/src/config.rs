//! Server configuration.

use std::time::Duration;

use greeter_transport::{DEFAULT_ACCEPT_BACKLOG, DEFAULT_MAX_FRAME_LENGTH};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ServerError};

/// Configuration for [`GreeterServer`](crate::GreeterServer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// `host:port` to listen on. Port `0` picks a free port.
    pub listen_address: String,
    /// Broadcast period in milliseconds.
    pub tick_interval_ms: u64,
    /// Largest frame payload in bytes.
    pub max_frame_length: usize,
    /// Accepted connections held while no session is waiting.
    pub accept_backlog: usize,
    /// How long the daemon waits for `run()` to return after `stop()`.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:50051".into(),
            tick_interval_ms: 100,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Config listening on `address` with every other value defaulted.
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            listen_address: address.into(),
            ..Self::default()
        }
    }

    /// Broadcast period.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Grace period for shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(ServerError::InvalidConfig(
                "listen address must not be empty".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "tick interval must be positive".into(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(ServerError::InvalidConfig(
                "max frame length must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_address, "127.0.0.1:50051");
        assert_eq!(cfg.tick_interval(), Duration::from_millis(100));
        assert_eq!(cfg.max_frame_length, 4 * 1024 * 1024);
        assert_eq!(cfg.accept_backlog, 128);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn with_address_keeps_defaults() {
        let cfg = ServerConfig::with_address("127.0.0.1:0");
        assert_eq!(cfg.listen_address, "127.0.0.1:0");
        assert_eq!(cfg.tick_interval_ms, 100);
    }

    #[test]
    fn zero_tick_is_invalid() {
        let cfg = ServerConfig {
            tick_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn blank_address_is_invalid() {
        let cfg = ServerConfig::with_address("  ");
        assert!(matches!(cfg.validate(), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn deserializes_partial_camel_case() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"listenAddress":"0.0.0.0:9000","tickIntervalMs":250}"#)
                .unwrap();
        assert_eq!(cfg.listen_address, "0.0.0.0:9000");
        assert_eq!(cfg.tick_interval_ms, 250);
        assert_eq!(cfg.accept_backlog, 128);
    }
}
