//! The transport operations a session issues, behind a trait so the session
//! state machine can be driven without sockets.

use std::net::SocketAddr;

use bytes::Bytes;
use greeter_transport::{CallContext, CompletionQueue, Server, TransportError};

/// Operations on one call, owned exclusively by its session.
///
/// Every operation that takes a tag reports later through a completion
/// queue; these methods only issue it.
pub trait CallOps: Send {
    /// Arm the call to accept the next client. `connected_tag` reports the
    /// accept, `finished_tag` reports the end of the call.
    fn arm(&mut self, connected_tag: u64, finished_tag: u64) -> Result<(), TransportError>;

    /// Issue a read.
    fn read(&mut self, tag: u64) -> Result<(), TransportError>;

    /// Payload delivered by the last successful read.
    fn take_inbound(&mut self) -> Option<Bytes>;

    /// Issue a write.
    fn write(&mut self, payload: Bytes, tag: u64) -> Result<(), TransportError>;

    /// Request cancellation of the call.
    fn cancel(&mut self);

    /// Remote address, once a client is bound.
    fn peer(&self) -> Option<SocketAddr>;
}

/// Creates fresh calls for new sessions.
pub trait CallSource: Send + Sync {
    /// A new, unarmed call.
    fn new_call(&self) -> Box<dyn CallOps>;
}

/// [`CallSource`] backed by a running transport server and its two queues.
pub struct TransportCalls {
    server: Server,
    call_queue: CompletionQueue,
    notification_queue: CompletionQueue,
}

impl TransportCalls {
    /// Calls report accepts and early finishes on `notification_queue` and
    /// everything else on `call_queue`.
    pub fn new(
        server: Server,
        call_queue: CompletionQueue,
        notification_queue: CompletionQueue,
    ) -> Self {
        Self {
            server,
            call_queue,
            notification_queue,
        }
    }
}

impl CallSource for TransportCalls {
    fn new_call(&self) -> Box<dyn CallOps> {
        Box::new(TransportCall {
            call: CallContext::new(),
            server: self.server.clone(),
            call_queue: self.call_queue.clone(),
            notification_queue: self.notification_queue.clone(),
        })
    }
}

struct TransportCall {
    call: CallContext,
    server: Server,
    call_queue: CompletionQueue,
    notification_queue: CompletionQueue,
}

impl CallOps for TransportCall {
    fn arm(&mut self, connected_tag: u64, finished_tag: u64) -> Result<(), TransportError> {
        self.call.notify_when_done(finished_tag);
        self.server.request_call(
            &self.call,
            &self.call_queue,
            &self.notification_queue,
            connected_tag,
        )
    }

    fn read(&mut self, tag: u64) -> Result<(), TransportError> {
        self.call.read(tag)
    }

    fn take_inbound(&mut self) -> Option<Bytes> {
        self.call.take_inbound()
    }

    fn write(&mut self, payload: Bytes, tag: u64) -> Result<(), TransportError> {
        self.call.write(payload, tag)
    }

    fn cancel(&mut self) {
        self.call.try_cancel();
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.call.peer()
    }
}
