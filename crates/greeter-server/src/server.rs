//! Server lifecycle: init, run, stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use greeter_transport::{CompletionQueue, Server};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call::TransportCalls;
use crate::config::ServerConfig;
use crate::dispatcher::{CompletionStream, Dispatcher};
use crate::errors::Result;
use crate::registry::{SessionRegistry, StatusCounts};
use crate::reply::ReplySource;
use crate::ticker::BroadcastTicker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Initialized,
    Running { since: Instant },
    Stopped,
}

/// Point-in-time view of a server.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Bound listener address.
    pub local_addr: SocketAddr,
    /// Whether `run()` is active and `stop()` has not been called.
    pub running: bool,
    /// When the server was initialized.
    pub started_at: DateTime<Utc>,
    /// Seconds since `run()` began, zero if not running.
    pub uptime_secs: u64,
    /// Registered sessions per status.
    pub sessions: StatusCounts,
}

/// Streaming greeter server.
///
/// Owns the transport, its two completion queues and the session registry.
/// `run()` drives the dispatch loops and the broadcast ticker until `stop()`
/// tears everything down in order.
pub struct GreeterServer {
    config: ServerConfig,
    transport: Server,
    call_queue: CompletionQueue,
    notification_queue: CompletionQueue,
    registry: Arc<SessionRegistry>,
    ticker_cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    started_at: DateTime<Utc>,
}

impl GreeterServer {
    /// Bind the listener and create the completion queues.
    ///
    /// Bind failure and unusable configuration are the only startup errors.
    pub async fn init(config: ServerConfig, replies: Arc<dyn ReplySource>) -> Result<Self> {
        config.validate()?;

        let mut builder = Server::builder();
        let _ = builder
            .add_listening_port(config.listen_address.clone())
            .max_frame_length(config.max_frame_length)
            .accept_backlog(config.accept_backlog);
        let call_queue = builder.add_completion_queue(CompletionStream::Call.as_str());
        let notification_queue =
            builder.add_completion_queue(CompletionStream::Notification.as_str());
        let transport = builder.build_and_start().await?;

        let calls = TransportCalls::new(
            transport.clone(),
            call_queue.clone(),
            notification_queue.clone(),
        );
        let registry = Arc::new(SessionRegistry::new(Arc::new(calls), replies));

        info!(
            local_addr = %transport.local_addr(),
            tick_interval_ms = config.tick_interval_ms,
            "greeter server initialized"
        );
        Ok(Self {
            config,
            transport,
            call_queue,
            notification_queue,
            registry,
            ticker_cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Initialized),
            started_at: Utc::now(),
        })
    }

    /// Seed one waiting session, then drive both dispatch loops and the
    /// ticker until [`stop`](Self::stop) has shut them all down.
    ///
    /// Runs at most once; later calls return immediately.
    pub async fn run(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Initialized {
                warn!(state = ?*lifecycle, "run called on a server that is not fresh, ignoring");
                return;
            }
            *lifecycle = Lifecycle::Running {
                since: Instant::now(),
            };
        }
        info!(local_addr = %self.local_addr(), "greeter server running");

        if self.registry.add_session().is_none() {
            error!("failed to seed the first waiting session");
        }

        let dispatcher = Dispatcher::new(Arc::clone(&self.registry));
        let call_loop = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let queue = self.call_queue.clone();
            async move { dispatcher.run(queue, CompletionStream::Call).await }
        });
        let notification_loop = tokio::spawn({
            let queue = self.notification_queue.clone();
            async move { dispatcher.run(queue, CompletionStream::Notification).await }
        });
        let ticker = BroadcastTicker::new(
            Arc::clone(&self.registry),
            self.config.tick_interval(),
            self.ticker_cancel.clone(),
        );
        let ticker_loop = tokio::spawn(async move { ticker.run().await });

        let (call, notification, ticks) = tokio::join!(call_loop, notification_loop, ticker_loop);
        let tasks = [
            ("call loop", call),
            ("notification loop", notification),
            ("ticker", ticks),
        ];
        for (task, result) in tasks {
            if let Err(e) = result {
                error!(task, error = %e, "server task failed");
            }
        }
        info!("greeter server run loop exited");
    }

    /// Shut down in order: ticker, connected sessions, transport, call
    /// queue, notification queue.
    ///
    /// Sessions still waiting for a client are not cancelled; the transport
    /// fails their accepts itself. No-op unless running.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Running { .. }) {
                debug!(state = ?*lifecycle, "stop called while not running");
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        info!("stopping greeter server");

        self.ticker_cancel.cancel();
        info!("broadcast ticker cancelled");

        let cancelled = self.registry.cancel_connected();
        info!(cancelled, "connected sessions cancelled");

        self.transport.shutdown().await;
        self.call_queue.shutdown();
        info!("call queue shut down");
        self.notification_queue.shutdown();
        info!("notification queue shut down");
    }

    /// Whether `run()` is active and `stop()` has not been called.
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Snapshot of the server state.
    pub fn stats(&self) -> ServerStats {
        let lifecycle = *self.lifecycle.lock();
        let (running, uptime_secs) = match lifecycle {
            Lifecycle::Running { since } => (true, since.elapsed().as_secs()),
            Lifecycle::Initialized | Lifecycle::Stopped => (false, 0),
        };
        ServerStats {
            local_addr: self.local_addr(),
            running,
            started_at: self.started_at,
            uptime_secs,
            sessions: self.registry.status_counts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServerError;
    use crate::test_support::fixed_replies;

    #[tokio::test]
    async fn init_rejects_zero_tick() {
        let config = ServerConfig {
            tick_interval_ms: 0,
            ..ServerConfig::with_address("127.0.0.1:0")
        };
        let result = GreeterServer::init(config, fixed_replies()).await;
        assert!(matches!(result, Err(ServerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn init_binds_ephemeral_port() {
        let server = GreeterServer::init(ServerConfig::with_address("127.0.0.1:0"), fixed_replies())
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(!server.is_running());
        assert!(server.registry().is_empty());
        let stats = server.stats();
        assert!(!stats.running);
        assert_eq!(stats.sessions.total(), 0);
    }

    #[tokio::test]
    async fn stop_before_run_is_noop() {
        let server = GreeterServer::init(ServerConfig::with_address("127.0.0.1:0"), fixed_replies())
            .await
            .unwrap();
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn stats_serialize_camel_case() {
        let server = GreeterServer::init(ServerConfig::with_address("127.0.0.1:0"), fixed_replies())
            .await
            .unwrap();
        let json = serde_json::to_value(server.stats()).unwrap();
        assert!(json["localAddr"].as_str().unwrap().starts_with("127.0.0.1:"));
        assert_eq!(json["running"], false);
        assert_eq!(json["sessions"]["waitConnect"], 0);
        assert!(json["startedAt"].is_string());
    }
}
