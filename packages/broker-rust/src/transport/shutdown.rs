//! Broker lifecycle: readiness, draining and in-flight call tracking.
//!
//! The lifecycle phase lives in an `ArcSwap` so every routing task can read
//! it without locking; in-flight calls are counted with RAII guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle phase of a broker.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed; the inbound loop has not been started.
    Starting,
    /// Routing calls and processing satellite frames.
    Ready,
    /// Refusing new calls while outstanding ones finish.
    Draining,
    /// All outstanding calls finished or were abandoned.
    Stopped,
}

/// Coordinates broker shutdown with the inbound loop and routing tasks.
///
/// 1. `route` checks [`accepts_calls`](Self::accepts_calls) before doing work
/// 2. every routed call holds a [`CallGuard`]
/// 3. `trigger_shutdown()` moves to `Draining` and wakes the inbound loop
/// 4. `wait_for_drain()` waits until the guard count reaches zero
#[derive(Debug)]
pub struct LifecycleController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    phase: Arc<ArcSwap<Phase>>,
}

impl LifecycleController {
    /// Creates a controller in the `Starting` phase.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            phase: Arc::new(ArcSwap::from_pointee(Phase::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.phase.store(Arc::new(Phase::Ready));
    }

    /// Returns a receiver notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals every shutdown receiver.
    pub fn trigger_shutdown(&self) {
        self.phase.store(Arc::new(Phase::Draining));
        // Receivers may already be gone.
        let _ = self.shutdown_signal.send(true);
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        **self.phase.load()
    }

    /// Calls are routed before `start()` (the broker context can call its
    /// own operations without an inbound loop) and while ready.
    #[must_use]
    pub fn accepts_calls(&self) -> bool {
        matches!(self.phase(), Phase::Starting | Phase::Ready)
    }

    /// Tracks one in-flight call until the guard is dropped.
    #[must_use]
    pub fn call_guard(&self) -> CallGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        CallGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight calls to finish, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` when everything drained;
    /// returns `false` (still `Draining`) when the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.mark_stopped();
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Moves to `Stopped` and signals every shutdown receiver again, so
    /// loops that kept running through `Draining` can exit.
    pub fn mark_stopped(&self) {
        self.phase.store(Arc::new(Phase::Stopped));
        let _ = self.shutdown_signal.send(true);
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard decrementing the in-flight call count when dropped, including
/// when the call future is cancelled.
#[derive(Debug)]
pub struct CallGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_progress_in_order() {
        let lifecycle = LifecycleController::new();
        assert_eq!(lifecycle.phase(), Phase::Starting);
        assert!(lifecycle.accepts_calls());

        lifecycle.set_ready();
        assert_eq!(lifecycle.phase(), Phase::Ready);
        assert!(lifecycle.accepts_calls());

        lifecycle.trigger_shutdown();
        assert_eq!(lifecycle.phase(), Phase::Draining);
        assert!(!lifecycle.accepts_calls());
    }

    #[test]
    fn call_guards_count_in_flight_calls() {
        let lifecycle = LifecycleController::new();
        let g1 = lifecycle.call_guard();
        let g2 = lifecycle.call_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);

        drop(g1);
        assert_eq!(lifecycle.in_flight_count(), 1);
        drop(g2);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let lifecycle = LifecycleController::new();
        let mut rx = lifecycle.shutdown_receiver();
        assert!(!*rx.borrow());

        lifecycle.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let lifecycle = LifecycleController::new();
        lifecycle.set_ready();
        let guard = lifecycle.call_guard();
        lifecycle.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(lifecycle.phase(), Phase::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_while_calls_remain() {
        let lifecycle = LifecycleController::new();
        let _guard = lifecycle.call_guard();
        lifecycle.trigger_shutdown();

        assert!(!lifecycle.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(lifecycle.phase(), Phase::Draining);
    }
}
