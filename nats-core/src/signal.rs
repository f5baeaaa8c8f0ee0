//! Replaceable single-shot completion signal.
//!
//! The connection state machine needs a handful of "everyone waiting on this
//! gets the same answer" completions: wait-for-open, info-received,
//! pong-or-error. Each is a single-shot event with possibly many concurrent
//! waiters, and each can be *replaced* with a fresh, uncompleted generation
//! (e.g. after a failed handshake, so the next caller gets a new shot rather
//! than the stale rejection).
//!
//! `futures::channel::oneshot` gives single-consumer completion; wrapping the
//! receiver in `Shared` turns it into something any number of clones can
//! await, each observing the same `T` once it arrives.

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;

struct Generation<T> {
    tx: Option<oneshot::Sender<T>>,
    rx: Shared<oneshot::Receiver<T>>,
}

/// A single-shot completion that can be awaited by multiple callers and reset
/// to a fresh, unfired generation.
pub struct Signal<T: Clone> {
    inner: Mutex<Generation<T>>,
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Signal<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: Mutex::new(Generation {
                tx: Some(tx),
                rx: rx.shared(),
            }),
        }
    }

    /// A future that resolves once this generation of the signal is
    /// completed. Cloning the returned future and awaiting it from many tasks
    /// is the intended usage; every clone observes the same value.
    #[must_use]
    pub fn wait(&self) -> Shared<oneshot::Receiver<T>> {
        self.inner.lock().rx.clone()
    }

    /// Complete the current generation. A no-op if it was already completed
    /// or replaced.
    pub fn complete(&self, value: T) {
        if let Some(tx) = self.inner.lock().tx.take() {
            let _ = tx.send(value);
        }
    }

    /// Replace the current generation with a fresh, uncompleted one. Anyone
    /// still awaiting a clone of the old generation's future that was never
    /// completed observes a cancellation; new callers of `wait()` get the new
    /// generation.
    pub fn reset(&self) {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock();
        guard.tx = Some(tx);
        guard.rx = rx.shared();
    }
}
