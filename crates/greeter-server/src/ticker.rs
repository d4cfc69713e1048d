//! Periodic server-initiated broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::metrics::BROADCAST_WRITES_TOTAL;
use crate::registry::SessionRegistry;

/// Shortest interval the ticker runs at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Calls [`Session::reply`](crate::Session::reply) on every registered
/// session once per interval.
pub struct BroadcastTicker {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
}

impl BroadcastTicker {
    /// Ticker over `registry` that stops when `cancel` fires.
    pub fn new(
        registry: Arc<SessionRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            interval: interval.max(MIN_INTERVAL),
            cancel,
        }
    }

    /// One broadcast pass. Returns the number of writes issued.
    ///
    /// The registry lock is released before any session lock is taken.
    pub fn tick(&self) -> usize {
        let sessions = self.registry.snapshot();
        let writes = sessions
            .iter()
            .filter(|session| session.lock().reply())
            .count();
        if writes > 0 {
            metrics::counter!(BROADCAST_WRITES_TOTAL).increment(writes as u64);
        }
        trace!(sessions = sessions.len(), writes, "broadcast tick");
        writes
    }

    /// Tick until cancelled. Returns the number of ticks run.
    pub async fn run(&self) -> u64 {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        let _ = interval.tick().await;

        info!(interval = ?self.interval, "broadcast ticker started");
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    let _ = self.tick();
                    ticks += 1;
                }
            }
        }
        info!(ticks, "broadcast ticker stopped");
        ticks
    }
}

#[cfg(test)]
mod tests {
    use greeter_core::EventKind;

    use super::*;
    use crate::test_support::{RecordingCalls, fixed_replies};

    fn setup() -> (RecordingCalls, Arc<SessionRegistry>) {
        let calls = RecordingCalls::new();
        let registry = Arc::new(SessionRegistry::new(Arc::new(calls.clone()), fixed_replies()));
        (calls, registry)
    }

    #[test]
    fn tick_writes_only_to_connected_sessions() {
        let (calls, registry) = setup();
        let a = registry.add_session().unwrap();
        let _waiting = registry.add_session().unwrap();
        let _ = a.lock().process(EventKind::Connected);

        let ticker = BroadcastTicker::new(
            Arc::clone(&registry),
            Duration::from_millis(100),
            CancellationToken::new(),
        );
        assert_eq!(ticker.tick(), 1);
        // write still in flight
        assert_eq!(ticker.tick(), 0);
        assert_eq!(calls.writes().len(), 1);

        let _ = a.lock().process(EventKind::WriteDone);
        assert_eq!(ticker.tick(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_on_interval_and_stops_on_cancel() {
        let (calls, registry) = setup();
        let a = registry.add_session().unwrap();
        let _ = a.lock().process(EventKind::Connected);

        let cancel = CancellationToken::new();
        let ticker = BroadcastTicker::new(
            Arc::clone(&registry),
            Duration::from_millis(100),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { ticker.run().await });

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        let ticks = handle.await.unwrap();
        assert_eq!(ticks, 3);
        // no WRITE_DONE was delivered, so only the first tick wrote
        assert_eq!(calls.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_interval_runs_no_ticks() {
        let (_, registry) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ticker = BroadcastTicker::new(registry, Duration::from_secs(60), cancel);
        assert_eq!(ticker.run().await, 0);
    }
}
