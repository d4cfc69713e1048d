//! Listener, accept matching and transport shutdown.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::call::CallContext;
use crate::errors::{Result, TransportError};
use crate::queue::CompletionQueue;
use crate::{DEFAULT_ACCEPT_BACKLOG, DEFAULT_MAX_FRAME_LENGTH};

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Configures and starts a [`Server`].
#[derive(Debug)]
pub struct ServerBuilder {
    listen_address: Option<String>,
    max_frame_length: usize,
    accept_backlog: usize,
    queues: Vec<CompletionQueue>,
}

impl ServerBuilder {
    /// Empty builder with default limits.
    pub fn new() -> Self {
        Self {
            listen_address: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            queues: Vec::new(),
        }
    }

    /// Listen on `address` (`host:port`). The last call wins.
    pub fn add_listening_port(&mut self, address: impl Into<String>) -> &mut Self {
        self.listen_address = Some(address.into());
        self
    }

    /// Largest frame payload accepted or sent.
    pub fn max_frame_length(&mut self, max_frame_length: usize) -> &mut Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// How many accepted connections may wait for an armed call.
    pub fn accept_backlog(&mut self, accept_backlog: usize) -> &mut Self {
        self.accept_backlog = accept_backlog;
        self
    }

    /// Create a completion queue to use with calls on this server.
    pub fn add_completion_queue(&mut self, name: impl Into<String>) -> CompletionQueue {
        let queue = CompletionQueue::new(name);
        self.queues.push(queue.clone());
        queue
    }

    /// Bind the listener and start accepting.
    pub async fn build_and_start(self) -> Result<Server> {
        let address = self
            .listen_address
            .ok_or(TransportError::NoListeningAddress)?;
        let listener = TcpListener::bind(address.as_str())
            .await
            .map_err(|source| TransportError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            local_addr,
            max_frame_length: self.max_frame_length,
            accept_backlog: self.accept_backlog,
            pending: Mutex::new(Pending::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        let _ = inner
            .tracker
            .spawn(accept_loop(Arc::clone(&inner), listener));

        info!(
            %local_addr,
            queues = self.queues.len(),
            max_frame_length = self.max_frame_length,
            "transport listening"
        );
        Ok(Server { inner })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ArmedCall {
    call: CallContext,
    notification_queue: CompletionQueue,
    tag: u64,
}

#[derive(Default)]
struct Pending {
    armed: VecDeque<ArmedCall>,
    backlog: VecDeque<(TcpStream, SocketAddr)>,
    shut_down: bool,
}

struct ServerInner {
    local_addr: SocketAddr,
    max_frame_length: usize,
    accept_backlog: usize,
    pending: Mutex<Pending>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// A running transport server.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shut_down(&self) -> bool {
        self.inner.pending.lock().shut_down
    }

    /// Arm `call` to accept the next client.
    ///
    /// Posts `(tag, true)` on `notification_queue` once a client is bound to
    /// the call, or `(tag, false)` if the call is cancelled or the server
    /// shuts down first. Reads and writes on the call later report on
    /// `call_queue`.
    pub fn request_call(
        &self,
        call: &CallContext,
        call_queue: &CompletionQueue,
        notification_queue: &CompletionQueue,
        tag: u64,
    ) -> Result<()> {
        let mut pending = self.inner.pending.lock();
        if pending.shut_down {
            return Err(TransportError::ShutDown);
        }
        call.mark_requested(call_queue, notification_queue, &self.inner.tracker)?;
        self.watch(call);

        if let Some((stream, peer)) = pending.backlog.pop_front() {
            match call.activate(stream, peer, self.inner.max_frame_length) {
                Ok(()) => {
                    debug!(%peer, tag, "backlogged client bound to call");
                    let _ = notification_queue.post(tag, true);
                }
                Err(stream) => pending.backlog.push_front((stream, peer)),
            }
            return Ok(());
        }

        pending.armed.push_back(ArmedCall {
            call: call.clone(),
            notification_queue: notification_queue.clone(),
            tag,
        });
        Ok(())
    }

    /// Stop accepting, fail pending accepts, cancel live calls and wait for
    /// every transport task to finish.
    ///
    /// Every completion the transport will ever post has been posted when
    /// this returns.
    pub async fn shutdown(&self) {
        let armed = {
            let mut pending = self.inner.pending.lock();
            pending.shut_down = true;
            pending.backlog.clear();
            std::mem::take(&mut pending.armed)
        };
        info!(pending_accepts = armed.len(), "transport shutting down");

        for armed in armed {
            let _ = armed.notification_queue.post(armed.tag, false);
            armed.call.finish();
        }
        self.inner.shutdown.cancel();
        let _ = self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("transport shut down");
    }

    /// Tie a requested call to the server lifetime.
    ///
    /// A call cancelled while armed fails its accept; a live call is
    /// cancelled when the server shuts down.
    fn watch(&self, call: &CallContext) {
        let inner = Arc::clone(&self.inner);
        let call = call.clone();
        let call_token = call.cancel_token();
        let _ = self.inner.tracker.spawn(async move {
            tokio::select! {
                () = inner.shutdown.cancelled() => call.try_cancel(),
                () = call_token.cancelled() => inner.withdraw(&call),
            }
        });
    }
}

impl ServerInner {
    fn dispatch_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut pending = self.pending.lock();
        if pending.shut_down {
            return;
        }

        while let Some(armed) = pending.armed.pop_front() {
            match armed.call.activate(stream, peer, self.max_frame_length) {
                Ok(()) => {
                    debug!(%peer, tag = armed.tag, "client bound to call");
                    let _ = armed.notification_queue.post(armed.tag, true);
                    return;
                }
                Err(returned) => stream = returned,
            }
        }

        if pending.backlog.len() >= self.accept_backlog {
            warn!(%peer, backlog = pending.backlog.len(), "accept backlog full, dropping client");
            return;
        }
        debug!(%peer, "no call armed, client backlogged");
        pending.backlog.push_back((stream, peer));
    }

    fn withdraw(&self, call: &CallContext) {
        let withdrawn = {
            let mut pending = self.pending.lock();
            let index = pending
                .armed
                .iter()
                .position(|armed| armed.call.same_call(call));
            index.and_then(|index| pending.armed.remove(index))
        };
        if let Some(armed) = withdrawn {
            debug!(tag = armed.tag, "cancelled call withdrawn before accept");
            let _ = armed.notification_queue.post(armed.tag, false);
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => inner.dispatch_connection(stream, peer),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    debug!(local_addr = %inner.local_addr, "accept loop stopped");
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
