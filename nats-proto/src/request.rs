//! Request/response registry (§4.5).
//!
//! One wildcard inbox subscription per connection backs every outstanding
//! request; the inbound handler parses the trailing integer off the reply
//! subject to find the waiter. Built on the same `SubscriptionRegistry` used
//! for ordinary subscribers rather than a parallel routing table.

use bytes::Bytes;
use futures::channel::oneshot;
use hashbrown::HashMap;
use nats_core::error::NatsError;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

use crate::command::{rent_command, Command, CommandPool, CommandQueueSender, PublishEntry};
use crate::subscription::{InboundMessage, SubscriptionHandle, SubscriptionRegistry};

type Waiter = oneshot::Sender<Result<InboundMessage, NatsError>>;

pub struct RequestRegistry {
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    inbox_prefix: String,
    subscriptions: Arc<SubscriptionRegistry>,
    queue_tx: CommandQueueSender,
    pool: Arc<CommandPool>,
    inbox_handle: Mutex<Option<SubscriptionHandle>>,
}

impl RequestRegistry {
    #[must_use]
    pub fn new(
        inbox_prefix: String,
        subscriptions: Arc<SubscriptionRegistry>,
        queue_tx: CommandQueueSender,
        pool: Arc<CommandPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbox_prefix,
            subscriptions,
            queue_tx,
            pool,
            inbox_handle: Mutex::new(None),
        })
    }

    /// Register a waiter, enqueue the request `PUB`, and return a future that
    /// resolves with the response (or fails with `ConnectionLost` on
    /// `reset()`).
    pub fn add(self: &Arc<Self>, subject: impl Into<String>, payload: Bytes) -> RequestFuture {
        self.ensure_inbox_subscription();

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);

        let reply_to = format!("{}{}", self.inbox_prefix, request_id);
        let command = Command::Publish(PublishEntry {
            subject: subject.into(),
            reply_to: Some(reply_to),
            headers: None,
            payload,
        });
        let slot = rent_command(&self.pool, command, None);
        let _ = self.queue_tx.send(slot);

        RequestFuture {
            request_id,
            registry: self.clone(),
            rx,
            completed: false,
        }
    }

    fn ensure_inbox_subscription(self: &Arc<Self>) {
        let mut guard = self.inbox_handle.lock();
        if guard.is_some() {
            return;
        }
        let wildcard = format!("{}*", self.inbox_prefix);
        let this = self.clone();
        let handle = self
            .subscriptions
            .add(wildcard, None, Arc::new(move |msg| this.route_inbound(msg)));
        *guard = Some(handle);
    }

    fn route_inbound(&self, msg: InboundMessage) {
        match parse_request_id(&msg.subject) {
            Some(request_id) => self.dispatch(request_id, msg),
            None => warn!(subject = %String::from_utf8_lossy(&msg.subject), "inbox message with no parseable request id"),
        }
    }

    /// Signal the waiter for `request_id`, if still registered.
    pub fn dispatch(&self, request_id: u64, msg: InboundMessage) {
        if let Some(tx) = self.waiters.lock().remove(&request_id) {
            let _ = tx.send(Ok(msg));
        }
    }

    fn remove_waiter(&self, request_id: u64) {
        self.waiters.lock().remove(&request_id);
    }

    /// Fail every outstanding waiter with `ConnectionLost` (Open→Reconnecting).
    pub fn reset(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for (_, tx) in waiters {
            let _ = tx.send(Err(NatsError::ConnectionLost));
        }
    }
}

fn parse_request_id(subject: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(subject).ok()?;
    text.rsplit('.').next()?.parse().ok()
}

/// Future returned by `RequestRegistry::add`. Dropping it before completion
/// removes the waiter (§4.5 "cancellation removes the waiter").
pub struct RequestFuture {
    request_id: u64,
    registry: Arc<RequestRegistry>,
    rx: oneshot::Receiver<Result<InboundMessage, NatsError>>,
    completed: bool,
}

impl Future for RequestFuture {
    type Output = Result<InboundMessage, NatsError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.completed = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_canceled)) => {
                self.completed = true;
                Poll::Ready(Err(NatsError::ConnectionLost))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RequestFuture {
    fn drop(&mut self) {
        if !self.completed {
            self.registry.remove_waiter(self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{new_command_pool, CommandSlot};
    use nats_core::pool::Rented;

    fn harness() -> (
        Arc<RequestRegistry>,
        flume::Receiver<Rented<CommandSlot>>,
    ) {
        let (tx, rx) = flume::unbounded();
        let pool = new_command_pool(16);
        let subs = SubscriptionRegistry::new(tx.clone(), pool.clone());
        let registry = RequestRegistry::new("_INBOX.conn1.".to_string(), subs, tx, pool);
        (registry, rx)
    }

    #[test]
    fn add_installs_wildcard_subscription_once() {
        let (registry, rx) = harness();
        let _fut1 = registry.add("svc", Bytes::from_static(b"a"));
        let _fut2 = registry.add("svc", Bytes::from_static(b"b"));

        let mut sub_count = 0;
        let mut pub_count = 0;
        while let Ok(slot) = rx.try_recv() {
            match slot.command {
                Command::Subscribe(_) => sub_count += 1,
                Command::Publish(_) => pub_count += 1,
                _ => {}
            }
        }
        assert_eq!(sub_count, 1, "wildcard inbox subscription installed once");
        assert_eq!(pub_count, 2);
    }

    #[test]
    fn dispatch_resolves_the_matching_future() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let (registry, rx) = harness();
            let fut = registry.add("svc", Bytes::from_static(b"ping"));

            let slot = loop {
                let slot = rx.try_recv().unwrap();
                if matches!(slot.command, Command::Publish(_)) {
                    break slot;
                }
            };
            let reply_to = match &slot.command {
                Command::Publish(entry) => entry.reply_to.clone().unwrap(),
                _ => unreachable!(),
            };
            let request_id: u64 = reply_to.rsplit('.').next().unwrap().parse().unwrap();

            registry.dispatch(
                request_id,
                InboundMessage {
                    subject: Bytes::copy_from_slice(reply_to.as_bytes()),
                    sid: 1,
                    reply_to: None,
                    headers: None,
                    payload: Bytes::from_static(b"pong"),
                },
            );

            let response = fut.await.unwrap();
            assert_eq!(&response.payload[..], b"pong");
        });
    }

    #[test]
    fn reset_fails_outstanding_waiters_with_connection_lost() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let (registry, _rx) = harness();
            let fut = registry.add("svc", Bytes::from_static(b"ping"));
            registry.reset();
            let err = fut.await.unwrap_err();
            assert!(matches!(err, NatsError::ConnectionLost));
        });
    }

    #[test]
    fn dropping_future_removes_waiter() {
        let (registry, _rx) = harness();
        let fut = registry.add("svc", Bytes::from_static(b"ping"));
        let request_id = fut.request_id;
        drop(fut);
        assert!(!registry.waiters.lock().contains_key(&request_id));
    }
}
