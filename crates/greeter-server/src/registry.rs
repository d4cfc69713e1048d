//! Session registry.
//!
//! One coarse lock guards the map structure only. Session methods never run
//! under it, except in [`SessionRegistry::cancel_connected`], which nests
//! registry then session. Nothing nests the other way round.

use std::collections::HashMap;
use std::sync::Arc;

use greeter_core::{SessionId, SessionIdAllocator};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

use crate::call::CallSource;
use crate::metrics::{
    SESSION_INIT_FAILURES_TOTAL, SESSIONS_CREATED_TOTAL, SESSIONS_REGISTERED,
    SESSIONS_REMOVED_TOTAL,
};
use crate::reply::ReplySource;
use crate::session::{Session, SessionRef, SessionStatus};

/// Number of registered sessions per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    /// Sessions waiting for a client.
    pub wait_connect: usize,
    /// Sessions bound to a client.
    pub connected: usize,
    /// Terminal sessions not yet removed.
    pub finished: usize,
}

impl StatusCounts {
    /// Sum over all statuses.
    pub fn total(&self) -> usize {
        self.wait_connect + self.connected + self.finished
    }
}

/// Maps live session identifiers to sessions and creates new ones.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionRef>>,
    ids: SessionIdAllocator,
    calls: Arc<dyn CallSource>,
    replies: Arc<dyn ReplySource>,
}

impl SessionRegistry {
    /// Empty registry handing out ids from 1.
    pub fn new(calls: Arc<dyn CallSource>, replies: Arc<dyn ReplySource>) -> Self {
        Self::with_allocator(calls, replies, SessionIdAllocator::new())
    }

    /// Empty registry drawing ids from `ids`.
    pub fn with_allocator(
        calls: Arc<dyn CallSource>,
        replies: Arc<dyn ReplySource>,
        ids: SessionIdAllocator,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ids,
            calls,
            replies,
        }
    }

    /// Create, register and arm a new waiting session.
    ///
    /// The session is inserted before it is armed, so its `CONNECTED`
    /// completion always finds it. If arming fails the entry is removed, the
    /// id is abandoned and `None` is returned.
    pub fn add_session(&self) -> Option<SessionRef> {
        let Some(id) = self.ids.allocate() else {
            error!("session id space exhausted, cannot create session");
            metrics::counter!(SESSION_INIT_FAILURES_TOTAL).increment(1);
            return None;
        };
        let session = Session::new(id, self.calls.new_call(), Arc::clone(&self.replies)).into_ref();
        // Insert before arming: a backlogged client makes the transport post
        // CONNECTED from inside `init`, and that completion must find the
        // session. A failed arm removes the entry again below.
        {
            let mut sessions = self.sessions.lock();
            let _ = sessions.insert(id, Arc::clone(&session));
            record_registered(sessions.len());
        }

        let armed = session.lock().init();
        match armed {
            Ok(()) => {
                metrics::counter!(SESSIONS_CREATED_TOTAL).increment(1);
                Some(session)
            }
            Err(e) => {
                {
                    let mut sessions = self.sessions.lock();
                    let _ = sessions.remove(&id);
                    record_registered(sessions.len());
                }
                metrics::counter!(SESSION_INIT_FAILURES_TOTAL).increment(1);
                error!(session_id = %id, error = %e, "failed to arm session, id discarded");
                None
            }
        }
    }

    /// Look up a session without touching its lock.
    pub fn get_session(&self, id: SessionId) -> Option<SessionRef> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove_session(&self, id: SessionId) -> Option<SessionRef> {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&id);
            record_registered(sessions.len());
            removed
        };
        if removed.is_some() {
            metrics::counter!(SESSIONS_REMOVED_TOTAL).increment(1);
            debug!(session_id = %id, "session removed from registry");
        }
        removed
    }

    /// Handles to every registered session.
    pub fn snapshot(&self) -> Vec<SessionRef> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Registered session ids, ascending.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Count sessions per status. Takes each session lock in turn after
    /// releasing the registry lock.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for session in self.snapshot() {
            match session.lock().status() {
                SessionStatus::WaitConnect => counts.wait_connect += 1,
                SessionStatus::Connected => counts.connected += 1,
                SessionStatus::Finished => counts.finished += 1,
            }
        }
        counts
    }

    /// Cancel every session that is no longer waiting for a client.
    ///
    /// Holds the registry lock throughout so no session can be added or
    /// removed while shutdown picks its targets. Returns how many sessions
    /// were cancelled.
    pub fn cancel_connected(&self) -> usize {
        let sessions = self.sessions.lock();
        let mut cancelled = 0;
        for session in sessions.values() {
            let mut session = session.lock();
            if session.status() != SessionStatus::WaitConnect {
                session.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_registered(len: usize) {
    metrics::gauge!(SESSIONS_REGISTERED).set(len as f64);
}
