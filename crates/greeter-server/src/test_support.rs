//! Recording doubles for the call seam and the reply source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use greeter_core::{SessionId, Tag};
use greeter_transport::TransportError;
use parking_lot::Mutex;

use crate::call::{CallOps, CallSource};
use crate::reply::{ReplyContext, ReplySource};

/// One operation issued on a recorded call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CallOp {
    Arm { connected: Tag, finished: Tag },
    Read(Tag),
    Write(Tag, Bytes),
    Cancel(Option<SessionId>),
}

#[derive(Default)]
struct Recorder {
    ops: Mutex<Vec<CallOp>>,
    inbound: Mutex<VecDeque<Bytes>>,
    fail_arm: AtomicBool,
    fail_read: AtomicBool,
}

/// [`CallSource`] whose calls log every operation instead of touching a
/// socket.
#[derive(Clone, Default)]
pub(crate) struct RecordingCalls {
    recorder: Arc<Recorder>,
}

impl RecordingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail_arm(&self, fail: bool) {
        self.recorder.fail_arm.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_read(&self, fail: bool) {
        self.recorder.fail_read.store(fail, Ordering::SeqCst);
    }

    /// Queue a payload for the next `take_inbound` on any call.
    pub(crate) fn push_inbound(&self, payload: &'static [u8]) {
        self.recorder
            .inbound
            .lock()
            .push_back(Bytes::from_static(payload));
    }

    pub(crate) fn ops(&self) -> Vec<CallOp> {
        self.recorder.ops.lock().clone()
    }

    pub(crate) fn writes(&self) -> Vec<(Tag, Bytes)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                CallOp::Write(tag, payload) => Some((tag, payload)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn reads(&self) -> Vec<Tag> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                CallOp::Read(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn cancelled(&self) -> Vec<Option<SessionId>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                CallOp::Cancel(session) => Some(session),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.recorder.ops.lock().clear();
    }
}

impl CallSource for RecordingCalls {
    fn new_call(&self) -> Box<dyn CallOps> {
        Box::new(RecordingCall {
            recorder: Arc::clone(&self.recorder),
            session: None,
        })
    }
}

struct RecordingCall {
    recorder: Arc<Recorder>,
    session: Option<SessionId>,
}

impl RecordingCall {
    fn record(&self, op: CallOp) {
        self.recorder.ops.lock().push(op);
    }
}

fn tag(raw: u64) -> Tag {
    Tag::decode(raw).expect("session issued an undecodable tag")
}

impl CallOps for RecordingCall {
    fn arm(&mut self, connected_tag: u64, finished_tag: u64) -> Result<(), TransportError> {
        if self.recorder.fail_arm.load(Ordering::SeqCst) {
            return Err(TransportError::ShutDown);
        }
        let connected = tag(connected_tag);
        self.session = Some(connected.session_id);
        self.record(CallOp::Arm {
            connected,
            finished: tag(finished_tag),
        });
        Ok(())
    }

    fn read(&mut self, raw: u64) -> Result<(), TransportError> {
        if self.recorder.fail_read.load(Ordering::SeqCst) {
            return Err(TransportError::NotActive);
        }
        self.record(CallOp::Read(tag(raw)));
        Ok(())
    }

    fn take_inbound(&mut self) -> Option<Bytes> {
        self.recorder.inbound.lock().pop_front()
    }

    fn write(&mut self, payload: Bytes, raw: u64) -> Result<(), TransportError> {
        self.record(CallOp::Write(tag(raw), payload));
        Ok(())
    }

    fn cancel(&mut self) {
        self.record(CallOp::Cancel(self.session));
    }

    fn peer(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

/// Replies with the same payload every time.
pub(crate) struct FixedReplies(pub(crate) &'static [u8]);

impl ReplySource for FixedReplies {
    fn next_reply(&self, _ctx: &ReplyContext<'_>) -> Option<Bytes> {
        Some(Bytes::from_static(self.0))
    }
}

pub(crate) fn fixed_replies() -> Arc<dyn ReplySource> {
    Arc::new(FixedReplies(b"tick"))
}
