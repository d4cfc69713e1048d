//! Completion dispatch loops.

use std::fmt;
use std::sync::Arc;

use greeter_core::{EventKind, SessionId, Tag};
use greeter_transport::{Completion, CompletionQueue};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::metrics::{COMPLETIONS_TOTAL, COMPLETIONS_UNKNOWN_TOTAL};
use crate::registry::SessionRegistry;
use crate::session::Transition;

/// Which completion queue an item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStream {
    /// Reads, writes and finishes of accepted calls.
    Call,
    /// Accepts, and finishes of calls that were never accepted.
    Notification,
}

impl CompletionStream {
    /// Lower-case name, used as a log field and metric label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for CompletionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`Dispatcher::handle`] did with one completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The tag's event bits named no known event.
    UnknownEvent,
    /// A `FINISHED` completion; `removed` is false if the session was
    /// already gone.
    Finished {
        /// Whether this completion removed the session.
        removed: bool,
    },
    /// The session had already been removed.
    AlreadyRemoved,
    /// The operation failed and the session was removed.
    Failed,
    /// The session processed the event.
    Processed(Transition),
}

/// Routes completions to sessions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    /// Dispatcher over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Drain `queue` until it reports closed. Returns the number of
    /// completions handled.
    pub async fn run(&self, queue: CompletionQueue, stream: CompletionStream) -> u64 {
        info!(%stream, "dispatch loop started");
        let mut handled: u64 = 0;
        while let Some(completion) = queue.next().await {
            let _ = self.handle(stream, completion);
            handled += 1;
        }
        info!(%stream, handled, "completion stream closed, dispatch loop exiting");
        handled
    }

    /// Handle one completion.
    pub fn handle(&self, stream: CompletionStream, completion: Completion) -> DispatchOutcome {
        metrics::counter!(COMPLETIONS_TOTAL, "stream" => stream.as_str()).increment(1);

        let Some(Tag { session_id, event }) = Tag::decode(completion.tag) else {
            metrics::counter!(COMPLETIONS_UNKNOWN_TOTAL).increment(1);
            warn!(
                %stream,
                raw_tag = completion.tag,
                ok = completion.ok,
                "unknown event in completion tag, skipping"
            );
            return DispatchOutcome::UnknownEvent;
        };
        trace!(%stream, %session_id, %event, ok = completion.ok, "completion dequeued");

        if event == EventKind::Finished {
            let removed = self.remove_and_close(session_id, stream, "call finished");
            return DispatchOutcome::Finished { removed };
        }

        let Some(session) = self.registry.get_session(session_id) else {
            debug!(
                %stream,
                %session_id,
                %event,
                ok = completion.ok,
                "session already removed, dropping completion"
            );
            return DispatchOutcome::AlreadyRemoved;
        };

        if !completion.ok {
            drop(session);
            let _ = self.remove_and_close(session_id, stream, "operation failed");
            return DispatchOutcome::Failed;
        }

        let transition = session.lock().process(event);
        if transition.left_wait_connect() {
            self.replenish(session_id);
        }
        if transition.reached_finished() {
            let _ = self.remove_and_close(session_id, stream, "session finished");
        }
        DispatchOutcome::Processed(transition)
    }

    fn remove_and_close(
        &self,
        session_id: SessionId,
        stream: CompletionStream,
        reason: &str,
    ) -> bool {
        match self.registry.remove_session(session_id) {
            Some(session) => {
                session.lock().close();
                info!(%stream, %session_id, reason, "session removed");
                true
            }
            None => {
                debug!(%stream, %session_id, reason, "session already removed");
                false
            }
        }
    }

    /// Keep one waiting session armed for the next client.
    fn replenish(&self, after: SessionId) {
        match self.registry.add_session() {
            Some(session) => {
                let id = session.lock().id();
                debug!(connected = %after, waiting = %id, "replacement session armed");
            }
            None => warn!(connected = %after, "failed to arm replacement session"),
        }
    }
}
