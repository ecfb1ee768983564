//! Shutdown and reconnection accounting: the gate publishers/subscribers
//! consult before touching the broker, and the in-flight handler counter an
//! orderly shutdown drains.

use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateState {
    Open,
    Reconnecting,
}

/// Broadcast gate with the state machine `Open → Reconnecting → Open`.
///
/// While `Reconnecting`, [`wait_open`](Self::wait_open) parks every caller;
/// flipping back to `Open` releases all of them at once.
#[derive(Debug)]
pub(crate) struct ConnectionGate {
    state: watch::Sender<GateState>,
}

impl ConnectionGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Open);
        Self { state }
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn set(&self, state: GateState) {
        self.state.send_replace(state);
    }

    pub async fn wait_open(&self) {
        let mut rx = self.state.subscribe();
        // Sender outlives every caller (both live on the transport), so
        // wait_for cannot observe a closed channel.
        let _ = rx.wait_for(|state| *state == GateState::Open).await;
    }
}

/// Counts handler executions currently in flight.
///
/// [`begin`](Self::begin) returns an RAII guard; dropping it decrements the
/// counter, so a panicking handler task still checks out.
#[derive(Debug)]
pub(crate) struct InFlightTracker {
    count: watch::Sender<usize>,
}

pub(crate) struct WorkGuard {
    count: watch::Sender<usize>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub fn begin(&self) -> WorkGuard {
        self.count.send_modify(|count| *count += 1);
        WorkGuard {
            count: self.count.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until no handler is in flight. Returns `false` if `timeout`
    /// elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0))
            .await
            .is_ok();
        result
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_starts_open() {
        let gate = ConnectionGate::new();
        assert_eq!(gate.state(), GateState::Open);
    }

    #[tokio::test]
    async fn wait_open_returns_immediately_when_open() {
        let gate = ConnectionGate::new();
        tokio::time::timeout(Duration::from_millis(50), gate.wait_open())
            .await
            .expect("open gate must not block");
    }

    #[tokio::test]
    async fn wait_open_blocks_while_reconnecting() {
        let gate = ConnectionGate::new();
        gate.set(GateState::Reconnecting);
        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.wait_open()).await;
        assert!(blocked.is_err(), "closed gate must park callers");
    }

    #[tokio::test]
    async fn reopening_releases_waiters() {
        let gate = std::sync::Arc::new(ConnectionGate::new());
        gate.set(GateState::Reconnecting);

        let waiter = {
            let gate = std::sync::Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_open().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set(GateState::Open);

        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter must be released")
            .expect("waiter task must not panic");
    }

    #[test]
    fn tracker_counts_guards() {
        let tracker = InFlightTracker::new();
        assert_eq!(tracker.in_flight(), 0);
        let g1 = tracker.begin();
        let g2 = tracker.begin();
        assert_eq!(tracker.in_flight(), 2);
        drop(g1);
        assert_eq!(tracker.in_flight(), 1);
        drop(g2);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_true_when_already_idle() {
        let tracker = InFlightTracker::new();
        assert!(tracker.wait_idle(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_work_outstanding() {
        let tracker = InFlightTracker::new();
        let _guard = tracker.begin();
        assert!(!tracker.wait_idle(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_idle_observes_guard_drop() {
        let tracker = std::sync::Arc::new(InFlightTracker::new());
        let guard = tracker.begin();

        let waiter = {
            let tracker = std::sync::Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        assert!(waiter.await.expect("waiter task must not panic"));
    }
}
