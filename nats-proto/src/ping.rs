//! RTT tracking for user-facing `ping()` calls (§4.7 inbound half).
//!
//! The keepalive watchdog (outstanding-ping counter, `max-pings-out` abort)
//! lives on `ReaderContext` in `reader.rs` since it only needs a counter. A
//! user `ping()` additionally wants the measured round-trip time, and the
//! spec only promises "complete the oldest in-flight ping-with-rtt" — FIFO
//! order, not request/response correlation by id, matches the server's
//! PING/PONG protocol (PONGs carry no identifying payload).

use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// FIFO of outstanding user `ping()` calls awaiting the next PONG.
#[derive(Default)]
pub struct PingRegistry {
    waiters: Mutex<VecDeque<(Instant, oneshot::Sender<Duration>)>>,
}

impl PingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new outstanding ping, starting the RTT clock now. Returns a
    /// future that resolves with the measured round-trip once the
    /// corresponding PONG arrives.
    pub fn register(&self) -> oneshot::Receiver<Duration> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back((Instant::now(), tx));
        rx
    }

    /// Complete the oldest outstanding waiter, if any, with its measured RTT.
    pub fn complete_oldest(&self) {
        if let Some((started, tx)) = self.waiters.lock().pop_front() {
            let _ = tx.send(started.elapsed());
        }
    }

    /// Drop every outstanding waiter without completing it (Open→Reconnecting):
    /// callers observe cancellation, matching §5's per-request cancellation
    /// semantics rather than a fabricated `ConnectionLost` RTT value.
    pub fn clear(&self) {
        self.waiters.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_oldest_first() {
        let registry = PingRegistry::new();
        let first = registry.register();
        let second = registry.register();
        registry.complete_oldest();
        assert!(first.try_recv().unwrap().is_some());
        assert!(second.try_recv().unwrap().is_none());
    }

    #[test]
    fn clear_drops_waiters_without_completing() {
        let registry = PingRegistry::new();
        let rx = registry.register();
        registry.clear();
        assert!(rx.try_recv().is_err() || rx.try_recv().unwrap().is_none());
    }
}
