//! Per-session state machine.
//!
//! ```text
//! WaitConnect --CONNECTED--> Connected --FINISHED--> Finished
//!                            |      ^
//!                            +------+ READ_DONE / WRITE_DONE
//! ```
//!
//! Every method runs under the session's own lock. Completions that do not
//! fit the current state are logged and dropped; they are expected while a
//! call is being torn down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use greeter_core::{EventKind, SessionId, Tag};
use greeter_transport::TransportError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::call::CallOps;
use crate::reply::{ReplyContext, ReplySource};

/// Shared handle to a session.
pub type SessionRef = Arc<Mutex<Session>>;

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Armed, waiting for a client.
    WaitConnect,
    /// Bound to a client.
    Connected,
    /// Terminal.
    Finished,
}

impl SessionStatus {
    /// Upper-case name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WaitConnect => "WAIT_CONNECT",
            Self::Connected => "CONNECTED",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of feeding one event to [`Session::process`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Status before the event.
    pub from: SessionStatus,
    /// Status after the event.
    pub to: SessionStatus,
    /// Whether the event was valid for `from`.
    pub handled: bool,
}

impl Transition {
    /// The session stopped waiting for a client.
    pub fn left_wait_connect(&self) -> bool {
        self.from == SessionStatus::WaitConnect && self.to != SessionStatus::WaitConnect
    }

    /// The session became terminal on this event.
    pub fn reached_finished(&self) -> bool {
        self.from != SessionStatus::Finished && self.to == SessionStatus::Finished
    }
}

/// Server-side state of one client exchange.
pub struct Session {
    id: SessionId,
    status: SessionStatus,
    accepted: bool,
    read_in_flight: bool,
    write_in_flight: bool,
    call: Box<dyn CallOps>,
    replies: Arc<dyn ReplySource>,
    last_inbound: Option<Bytes>,
    last_broadcast: Option<Bytes>,
    messages_received: u64,
    messages_sent: u64,
}

impl Session {
    /// A session in `WaitConnect` that has not been armed yet.
    pub fn new(id: SessionId, call: Box<dyn CallOps>, replies: Arc<dyn ReplySource>) -> Self {
        Self {
            id,
            status: SessionStatus::WaitConnect,
            accepted: false,
            read_in_flight: false,
            write_in_flight: false,
            call,
            replies,
            last_inbound: None,
            last_broadcast: None,
            messages_received: 0,
            messages_sent: 0,
        }
    }

    /// Wrap in a [`SessionRef`].
    pub fn into_ref(self) -> SessionRef {
        Arc::new(Mutex::new(self))
    }

    /// Identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether a read has been issued and not yet completed.
    pub fn read_in_flight(&self) -> bool {
        self.read_in_flight
    }

    /// Whether a write has been issued and not yet completed.
    pub fn write_in_flight(&self) -> bool {
        self.write_in_flight
    }

    /// Latest payload read from the client.
    pub fn last_inbound(&self) -> Option<&Bytes> {
        self.last_inbound.as_ref()
    }

    /// Latest payload handed to the transport by [`reply`](Self::reply).
    pub fn last_broadcast(&self) -> Option<&Bytes> {
        self.last_broadcast.as_ref()
    }

    /// Payloads read from the client.
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Writes issued to the client.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Client address, once connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.call.peer()
    }

    /// Arm the call: the accept reports `CONNECTED`, the end of the call
    /// reports `FINISHED`.
    pub fn init(&mut self) -> Result<(), TransportError> {
        let connected = Tag::new(self.id, EventKind::Connected).encode();
        let finished = Tag::new(self.id, EventKind::Finished).encode();
        self.call.arm(connected, finished)?;
        debug!(session_id = %self.id, "session armed, waiting for client");
        Ok(())
    }

    /// Advance the state machine by one successful completion.
    pub fn process(&mut self, event: EventKind) -> Transition {
        let from = self.status;
        let handled = match (from, event) {
            (SessionStatus::WaitConnect, EventKind::Connected) => {
                self.status = SessionStatus::Connected;
                self.accepted = true;
                info!(session_id = %self.id, peer = ?self.call.peer(), "client connected");
                self.issue_read();
                true
            }
            (SessionStatus::Connected, EventKind::ReadDone) => {
                self.read_in_flight = false;
                if let Some(payload) = self.call.take_inbound() {
                    self.messages_received += 1;
                    debug!(session_id = %self.id, bytes = payload.len(), "payload received");
                    self.last_inbound = Some(payload);
                }
                self.issue_read();
                true
            }
            (SessionStatus::Connected, EventKind::WriteDone) => {
                self.write_in_flight = false;
                true
            }
            (SessionStatus::Connected, EventKind::Finished) => {
                self.status = SessionStatus::Finished;
                true
            }
            (status, event) => {
                warn!(
                    session_id = %self.id,
                    %status,
                    %event,
                    "event not valid in current state, ignoring"
                );
                false
            }
        };
        Transition {
            from,
            to: self.status,
            handled,
        }
    }

    /// A read that cannot be issued leaves the status alone: the call is
    /// already over, and its `FINISHED` completion removes the session.
    fn issue_read(&mut self) {
        let tag = Tag::new(self.id, EventKind::ReadDone).encode();
        match self.call.read(tag) {
            Ok(()) => self.read_in_flight = true,
            Err(e) => {
                self.read_in_flight = false;
                warn!(
                    session_id = %self.id,
                    error = %e,
                    "failed to issue read, waiting for call to finish"
                );
            }
        }
    }

    /// Issue one server-initiated write.
    ///
    /// No-op unless connected with no write in flight. Returns whether a
    /// write was issued.
    pub fn reply(&mut self) -> bool {
        if self.status != SessionStatus::Connected || self.write_in_flight {
            return false;
        }
        let ctx = ReplyContext {
            session_id: self.id,
            sequence: self.messages_sent + 1,
            last_inbound: self.last_inbound.as_deref(),
        };
        let Some(payload) = self.replies.next_reply(&ctx) else {
            return false;
        };
        let tag = Tag::new(self.id, EventKind::WriteDone).encode();
        match self.call.write(payload.clone(), tag) {
            Ok(()) => {
                self.write_in_flight = true;
                self.messages_sent += 1;
                self.last_broadcast = Some(payload);
                true
            }
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "write not issued");
                false
            }
        }
    }

    /// Request cancellation of the call. Completions still arrive through
    /// the queues.
    pub fn cancel(&mut self) {
        info!(session_id = %self.id, status = %self.status, "cancelling session");
        self.call.cancel();
    }

    /// Mark terminal after removal from the registry.
    ///
    /// A call that was accepted is cancelled so its socket is released; a
    /// call still waiting for a client is left to the transport.
    pub fn close(&mut self) {
        let from = self.status;
        self.status = SessionStatus::Finished;
        self.read_in_flight = false;
        self.write_in_flight = false;
        if self.accepted {
            self.call.cancel();
        }
        debug!(session_id = %self.id, %from, "session closed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("read_in_flight", &self.read_in_flight)
            .field("write_in_flight", &self.write_in_flight)
            .finish_non_exhaustive()
    }
}
