//! # greeter-daemon
//!
//! Loads settings, starts the greeter server and stops it on ctrl-c.
//!
//! Precedence: command-line flags, then `GREETER_*` environment variables,
//! then the settings file, then compiled defaults.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use greeter_core::logging::init_subscriber;
use greeter_server::{GreeterServer, GreetingReplies, ServerConfig};
use greeter_settings::GreeterSettings;
use tracing::{debug, info, warn};

/// Streaming greeter server.
#[derive(Parser, Debug)]
#[command(name = "greeter-daemon", about = "Streaming greeter server")]
struct Cli {
    /// Settings file (defaults to `~/.greeter/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, `host:port`.
    #[arg(long)]
    listen: Option<String>,

    /// Broadcast period in milliseconds.
    #[arg(long)]
    tick_interval_ms: Option<u64>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(greeter_settings::settings_path)
    }

    /// Lay flags over loaded settings.
    fn apply(&self, settings: &mut GreeterSettings) {
        if let Some(listen) = &self.listen {
            settings.server.listen_address.clone_from(listen);
        }
        if let Some(ms) = self.tick_interval_ms {
            settings.server.tick_interval_ms = ms;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn server_config(settings: &GreeterSettings) -> ServerConfig {
    ServerConfig {
        listen_address: settings.server.listen_address.clone(),
        tick_interval_ms: settings.server.tick_interval_ms,
        max_frame_length: settings.server.max_frame_length,
        accept_backlog: settings.server.accept_backlog,
        shutdown_timeout_secs: settings.server.shutdown_timeout_secs,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings_path();
    let mut settings = greeter_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.format);
    let metrics = match greeter_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let config = server_config(&settings);
    let shutdown_timeout = config.shutdown_timeout();
    let replies = Arc::new(GreetingReplies::new(settings.server.greeting_prefix.clone()));
    let server = Arc::new(
        GreeterServer::init(config, replies)
            .await
            .context("failed to start greeter server")?,
    );
    info!(
        local_addr = %server.local_addr(),
        settings = %path.display(),
        "greeter daemon listening"
    );

    let run = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    server.stop().await;
    match tokio::time::timeout(shutdown_timeout, run).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "server run task failed"),
        Err(_) => warn!(?shutdown_timeout, "server did not stop before the shutdown timeout"),
    }

    if let Ok(stats) = serde_json::to_string(&server.stats()) {
        info!(%stats, "final server stats");
    }
    if let Some(handle) = metrics {
        debug!(metrics = %greeter_server::metrics::render(&handle), "final metrics");
    }
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_leave_settings_untouched() {
        let cli = Cli::parse_from(["greeter-daemon"]);
        let mut settings = GreeterSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, GreeterSettings::default());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "greeter-daemon",
            "--listen",
            "0.0.0.0:7000",
            "--tick-interval-ms",
            "250",
            "--log-level",
            "debug",
        ]);
        let mut settings = GreeterSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.listen_address, "0.0.0.0:7000");
        assert_eq!(settings.server.tick_interval_ms, 250);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn config_flag_selects_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(&path, r#"{"server": {"greetingPrefix": "Howdy", "acceptBacklog": 8}}"#)
            .unwrap();
        let cli = Cli::parse_from(["greeter-daemon", "--config", path.to_str().unwrap()]);
        assert_eq!(cli.settings_path(), path);

        let settings = greeter_settings::load_settings_from_path(&cli.settings_path()).unwrap();
        assert_eq!(settings.server.greeting_prefix, "Howdy");
        assert_eq!(server_config(&settings).accept_backlog, 8);
    }

    #[test]
    fn server_config_mirrors_settings() {
        let settings = GreeterSettings::default();
        let config = server_config(&settings);
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(Cli::try_parse_from(["greeter-daemon", "--port", "1"]).is_err());
    }
}
