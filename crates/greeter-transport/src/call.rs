//! Server-side call handle.
//!
//! A [`CallContext`] moves through `Idle → Requested → Active → Done`.
//! Reads and writes run on tracked tasks and report through the call queue;
//! the done notification reports through whichever queue matches the phase
//! the call was in when it ended.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::errors::{Result, TransportError};
use crate::queue::CompletionQueue;

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Requested,
    Active,
    Done,
}

struct CallState {
    phase: Phase,
    peer: Option<SocketAddr>,
    reader: Option<Arc<tokio::sync::Mutex<FrameReader>>>,
    writer: Option<Arc<tokio::sync::Mutex<FrameWriter>>>,
    inbound: Option<Bytes>,
    reading: bool,
    writing: bool,
    call_queue: Option<CompletionQueue>,
    notification_queue: Option<CompletionQueue>,
    tracker: Option<TaskTracker>,
    done_tag: Option<u64>,
}

struct CallInner {
    state: Mutex<CallState>,
    cancel: CancellationToken,
}

/// Handle to one server-side streaming call.
///
/// Cloning yields another handle to the same call.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<CallInner>,
}

impl CallContext {
    /// A fresh call, not yet requested.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CallInner {
                state: Mutex::new(CallState {
                    phase: Phase::Idle,
                    peer: None,
                    reader: None,
                    writer: None,
                    inbound: None,
                    reading: false,
                    writing: false,
                    call_queue: None,
                    notification_queue: None,
                    tracker: None,
                    done_tag: None,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Ask for `tag` to be posted once when the call ends.
    ///
    /// Must be set before [`Server::request_call`](crate::Server::request_call).
    /// The tag goes to the call queue if the call was accepted and to the
    /// notification queue if it ended while still waiting for a client.
    pub fn notify_when_done(&self, tag: u64) {
        self.inner.state.lock().done_tag = Some(tag);
    }

    /// Remote address, once accepted.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.state.lock().peer
    }

    /// Whether a client has been accepted and the call has not ended.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().phase == Phase::Active
    }

    /// Whether the call has ended for any reason.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().phase == Phase::Done
    }

    /// Whether cancellation was requested or the call otherwise ended.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Read one frame. Posts `(tag, true)` to the call queue once a frame is
    /// available through [`take_inbound`](Self::take_inbound), or
    /// `(tag, false)` when the peer closed, the frame was invalid, or the
    /// call was cancelled.
    pub fn read(&self, tag: u64) -> Result<()> {
        let (reader, queue, tracker) = {
            let mut state = self.inner.state.lock();
            let (reader, queue, tracker) = state.active_parts(|s| s.reader.clone())?;
            if state.reading {
                return Err(TransportError::OperationInFlight("read"));
            }
            state.reading = true;
            (reader, queue, tracker)
        };

        let call = self.clone();
        let cancel = self.inner.cancel.clone();
        let _ = tracker.spawn(async move {
            let ok = {
                let mut reader = reader.lock().await;
                tokio::select! {
                    () = cancel.cancelled() => false,
                    frame = reader.next() => match frame {
                        Some(Ok(frame)) => {
                            call.inner.state.lock().inbound = Some(frame.freeze());
                            true
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "read failed");
                            false
                        }
                        None => {
                            trace!("peer closed its side of the stream");
                            false
                        }
                    },
                }
            };
            call.inner.state.lock().reading = false;
            let _ = queue.post(tag, ok);
            if !ok {
                call.finish();
            }
        });
        Ok(())
    }

    /// Take the frame delivered by the last successful read.
    pub fn take_inbound(&self) -> Option<Bytes> {
        self.inner.state.lock().inbound.take()
    }

    /// Write one frame. Posts `(tag, ok)` to the call queue once the frame
    /// has been flushed to the socket or the write failed.
    pub fn write(&self, payload: Bytes, tag: u64) -> Result<()> {
        let (writer, queue, tracker) = {
            let mut state = self.inner.state.lock();
            let (writer, queue, tracker) = state.active_parts(|s| s.writer.clone())?;
            if state.writing {
                return Err(TransportError::OperationInFlight("write"));
            }
            state.writing = true;
            (writer, queue, tracker)
        };

        let call = self.clone();
        let cancel = self.inner.cancel.clone();
        let _ = tracker.spawn(async move {
            let ok = {
                let mut writer = writer.lock().await;
                tokio::select! {
                    () = cancel.cancelled() => false,
                    sent = writer.send(payload) => match sent {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(error = %e, "write failed");
                            false
                        }
                    },
                }
            };
            call.inner.state.lock().writing = false;
            let _ = queue.post(tag, ok);
            if !ok {
                call.finish();
            }
        });
        Ok(())
    }

    /// Request cancellation. In-flight operations complete with `ok == false`
    /// and the done notification is posted.
    pub fn try_cancel(&self) {
        debug!(peer = ?self.peer(), "call cancellation requested");
        self.finish();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn same_call(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_requested(
        &self,
        call_queue: &CompletionQueue,
        notification_queue: &CompletionQueue,
        tracker: &TaskTracker,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return Err(TransportError::AlreadyRequested);
        }
        state.phase = Phase::Requested;
        state.call_queue = Some(call_queue.clone());
        state.notification_queue = Some(notification_queue.clone());
        state.tracker = Some(tracker.clone());
        Ok(())
    }

    /// Bind an accepted connection. Hands the stream back if the call can no
    /// longer take it.
    pub(crate) fn activate(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        max_frame_length: usize,
    ) -> std::result::Result<(), TcpStream> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Requested {
            return Err(stream);
        }
        let (read_half, write_half) = stream.into_split();
        state.reader = Some(Arc::new(tokio::sync::Mutex::new(FramedRead::new(
            read_half,
            crate::frame_codec(max_frame_length),
        ))));
        state.writer = Some(Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            write_half,
            crate::frame_codec(max_frame_length),
        ))));
        state.peer = Some(peer);
        state.phase = Phase::Active;
        Ok(())
    }

    /// End the call: release the socket, cancel in-flight operations and
    /// post the done notification. Runs at most once.
    pub(crate) fn finish(&self) {
        let notify = {
            let mut state = self.inner.state.lock();
            let queue = match state.phase {
                Phase::Done => return,
                Phase::Active => state.call_queue.clone(),
                Phase::Idle | Phase::Requested => state.notification_queue.clone(),
            };
            state.phase = Phase::Done;
            state.reader = None;
            state.writer = None;
            state.done_tag.zip(queue)
        };
        self.inner.cancel.cancel();
        if let Some((tag, queue)) = notify {
            let _ = queue.post(tag, true);
        }
    }
}

impl CallState {
    fn active_parts<T>(
        &self,
        pick: impl FnOnce(&Self) -> Option<T>,
    ) -> Result<(T, CompletionQueue, TaskTracker)> {
        if self.phase != Phase::Active {
            return Err(TransportError::NotActive);
        }
        match (pick(self), self.call_queue.clone(), self.tracker.clone()) {
            (Some(half), Some(queue), Some(tracker)) => Ok((half, queue, tracker)),
            _ => Err(TransportError::NotActive),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CallContext")
            .field("phase", &state.phase)
            .field("peer", &state.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_call_is_idle() {
        let call = CallContext::new();
        assert!(!call.is_active());
        assert!(!call.is_done());
        assert!(call.peer().is_none());
    }

    #[test]
    fn read_before_accept_is_not_active() {
        let call = CallContext::new();
        assert!(matches!(call.read(1), Err(TransportError::NotActive)));
    }

    #[test]
    fn write_before_accept_is_not_active() {
        let call = CallContext::new();
        let result = call.write(Bytes::from_static(b"hi"), 1);
        assert!(matches!(result, Err(TransportError::NotActive)));
    }

    #[test]
    fn second_request_is_rejected() {
        let call = CallContext::new();
        let queue = CompletionQueue::new("q");
        let tracker = TaskTracker::new();
        call.mark_requested(&queue, &queue, &tracker).unwrap();
        let again = call.mark_requested(&queue, &queue, &tracker);
        assert!(matches!(again, Err(TransportError::AlreadyRequested)));
    }

    #[tokio::test]
    async fn cancel_while_requested_notifies_on_notification_queue() {
        let call = CallContext::new();
        let call_queue = CompletionQueue::new("call");
        let notification_queue = CompletionQueue::new("notification");
        call.notify_when_done(99);
        call.mark_requested(&call_queue, &notification_queue, &TaskTracker::new())
            .unwrap();

        call.try_cancel();
        assert!(call.is_done());
        assert!(call.is_cancelled());

        notification_queue.shutdown();
        call_queue.shutdown();
        let done = notification_queue.next().await.unwrap();
        assert_eq!((done.tag, done.ok), (99, true));
        assert_eq!(call_queue.next().await, None);
    }

    #[tokio::test]
    async fn finish_runs_once() {
        let call = CallContext::new();
        let queue = CompletionQueue::new("q");
        call.notify_when_done(5);
        call.mark_requested(&queue, &queue, &TaskTracker::new()).unwrap();

        call.try_cancel();
        call.try_cancel();
        queue.shutdown();
        assert!(queue.next().await.is_some());
        assert_eq!(queue.next().await, None);
    }

    #[test]
    fn cancel_of_idle_call_posts_nothing() {
        let call = CallContext::new();
        call.notify_when_done(1);
        call.try_cancel();
        assert!(call.is_done());
    }
}
