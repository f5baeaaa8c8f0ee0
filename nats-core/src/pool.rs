//! Generation-counted object pool.
//!
//! Commands are rented, serialized exactly once, and returned. To avoid a
//! stale completion from a prior rental firing against a slot that has since
//! been reused, every pooled slot carries a generation counter that is bumped
//! on each `rent`; holders of a `PooledHandle` can check `is_current()` before
//! acting on a completion signal that might have arrived after the slot was
//! recycled.

use parking_lot::Mutex;
use std::sync::Arc;

struct Slot<T> {
    value: Option<T>,
    generation: u64,
}

struct Inner<T> {
    free: Vec<Slot<T>>,
    max_size: usize,
}

/// A free-list pool of reusable `T` instances, each tagged with a generation
/// counter.
pub struct Pool<T> {
    inner: Mutex<Inner<T>>,
}

/// A rented value plus the generation it was rented at and a handle back to
/// the pool for return-on-drop.
pub struct Rented<T> {
    value: Option<T>,
    generation: u64,
    pool: Arc<Pool<T>>,
}

impl<T> Pool<T> {
    #[must_use]
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                free: Vec::with_capacity(max_size.min(64)),
                max_size,
            }),
        })
    }

    /// Rent a value, constructing a fresh one via `make` if the free list is
    /// empty.
    pub fn rent(self: &Arc<Self>, make: impl FnOnce() -> T) -> Rented<T> {
        let mut inner = self.inner.lock();
        if let Some(mut slot) = inner.free.pop() {
            slot.generation += 1;
            let generation = slot.generation;
            let value = slot.value.take().unwrap_or_else(make);
            drop(inner);
            return Rented {
                value: Some(value),
                generation,
                pool: self.clone(),
            };
        }
        drop(inner);
        Rented {
            value: Some(make()),
            generation: 0,
            pool: self.clone(),
        }
    }

    fn recycle(&self, value: T, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.free.len() < inner.max_size {
            inner.free.push(Slot {
                value: Some(value),
                generation,
            });
        }
    }
}

impl<T> Rented<T> {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// True if `generation` matches the generation this value was rented at —
    /// use to reject a completion that arrived for a slot already recycled
    /// and re-rented.
    #[must_use]
    pub const fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

impl<T> std::ops::Deref for Rented<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("value present until drop")
    }
}

impl<T> std::ops::DerefMut for Rented<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value present until drop")
    }
}

impl<T> Drop for Rented<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.recycle(value, self.generation);
        }
    }
}
