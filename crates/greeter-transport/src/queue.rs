//! Completion queues.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A finished operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Tag supplied when the operation was issued, returned unchanged.
    pub tag: u64,
    /// Whether the operation succeeded.
    pub ok: bool,
}

/// FIFO of completions for operations issued against it.
///
/// Cloning yields another handle to the same queue. Several tasks may drain
/// one queue; each completion is delivered to exactly one of them.
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    /// `None` once shut down. Posting happens under this lock, so every
    /// accepted post is enqueued before the channel closes.
    tx: Mutex<Option<mpsc::UnboundedSender<Completion>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Completion>>,
}

impl CompletionQueue {
    /// Create an empty queue. `name` only appears in logs.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Post a completion.
    ///
    /// Returns `false` (and drops the completion) once the queue is shut down.
    /// A post that returns `true` is always delivered by [`next`](Self::next).
    pub fn post(&self, tag: u64, ok: bool) -> bool {
        let tx = self.inner.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!(
                queue = %self.inner.name,
                tag,
                ok,
                "completion after queue shutdown dropped"
            );
            return false;
        };
        trace!(queue = %self.inner.name, tag, ok, "completion posted");
        tx.send(Completion { tag, ok }).is_ok()
    }

    /// Wait for the next completion.
    ///
    /// Returns `None` once the queue has been shut down and every completion
    /// posted before the shutdown has been delivered.
    pub async fn next(&self) -> Option<Completion> {
        self.inner.rx.lock().await.recv().await
    }

    /// Stop accepting completions and let drains finish.
    pub fn shutdown(&self) {
        if self.inner.tx.lock().take().is_some() {
            debug!(queue = %self.inner.name, "completion queue shut down");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    /// Whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("name", &self.inner.name)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn delivers_in_post_order() {
        let queue = CompletionQueue::new("test");
        assert!(queue.post(1, true));
        assert!(queue.post(2, false));
        assert_eq!(queue.next().await, Some(Completion { tag: 1, ok: true }));
        assert_eq!(queue.next().await, Some(Completion { tag: 2, ok: false }));
    }

    #[tokio::test]
    async fn drains_backlog_after_shutdown_then_closes() {
        let queue = CompletionQueue::new("test");
        let _ = queue.post(7, true);
        queue.shutdown();
        assert_eq!(queue.next().await, Some(Completion { tag: 7, ok: true }));
        assert_eq!(queue.next().await, None);
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn post_after_shutdown_is_dropped() {
        let queue = CompletionQueue::new("test");
        queue.shutdown();
        assert!(!queue.post(1, true));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_drain() {
        let queue = CompletionQueue::new("test");
        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn blocked_drain_wakes_on_post() {
        let queue = CompletionQueue::new("test");
        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = queue.post(3, true);
        let result = tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Some(Completion { tag: 3, ok: true }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn accepted_posts_racing_shutdown_are_delivered() {
        let queue = CompletionQueue::new("race");
        let posters: Vec<_> = (0..4_u64)
            .map(|worker| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut accepted = 0_u64;
                    for i in 0..500 {
                        if queue.post(worker * 1000 + i, true) {
                            accepted += 1;
                        }
                        tokio::task::yield_now().await;
                    }
                    accepted
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        queue.shutdown();

        let mut accepted = 0;
        for poster in posters {
            accepted += poster.await.unwrap();
        }
        let mut delivered = 0;
        while queue.next().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, accepted);
        assert!(!queue.post(1, true));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let queue = CompletionQueue::new("test");
        queue.shutdown();
        queue.shutdown();
        assert!(queue.is_shut_down());
    }

    #[test]
    fn clones_share_the_queue() {
        let a = CompletionQueue::new("a");
        let b = a.clone();
        let c = CompletionQueue::new("a");
        assert!(a.same_queue(&b));
        assert!(!a.same_queue(&c));
        assert_eq!(b.name(), "a");
    }
}
