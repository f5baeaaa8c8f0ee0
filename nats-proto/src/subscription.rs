//! Subscription registry (§4.4).
//!
//! Routing is per-sid, not per-subject: the server binds sid to subject at
//! `SUB` time, so dispatch is a single `O(1)` map lookup rather than the
//! sorted-prefix trie this codebase used for its ZMTP pub/sub hub.

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

use crate::command::{
    rent_command, Command, CommandPool, CommandQueueSender, PublishEntry, SubscribeEntry,
};

/// A single inbound `MSG`/`HMSG`, handed to subscribers as a view into the
/// receive buffer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: Bytes,
    pub sid: u64,
    pub reply_to: Option<Bytes>,
    pub headers: Option<Bytes>,
    pub payload: Bytes,
}

pub type Handler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// A server-side request handler: receives the request, returns the bytes to
/// publish back to `reply_to` (or `None` to send nothing).
pub type RequestHandler = Arc<dyn Fn(InboundMessage) -> Option<Bytes> + Send + Sync>;

enum Kind {
    Plain(Handler),
    Request(RequestHandler),
}

struct Entry {
    subject: String,
    queue_group: Option<String>,
    kind: Kind,
}

/// Maps subscription id to handler; persists across reconnects (the ids and
/// subjects are replayed, see `list_for_replay`).
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    next_sid: AtomicU64,
    queue_tx: CommandQueueSender,
    pool: Arc<CommandPool>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(queue_tx: CommandQueueSender, pool: Arc<CommandPool>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
            queue_tx,
            pool,
        })
    }

    /// Register a plain subscriber and enqueue the `SUB` command.
    pub fn add(
        self: &Arc<Self>,
        subject: impl Into<String>,
        queue_group: Option<String>,
        handler: Handler,
    ) -> SubscriptionHandle {
        self.add_inner(subject.into(), queue_group, Kind::Plain(handler))
    }

    /// Register a server-side request handler (§4.4 `add-request-handler`).
    pub fn add_request_handler(
        self: &Arc<Self>,
        subject: impl Into<String>,
        handler: RequestHandler,
    ) -> SubscriptionHandle {
        self.add_inner(subject.into(), None, Kind::Request(handler))
    }

    fn add_inner(
        self: &Arc<Self>,
        subject: String,
        queue_group: Option<String>,
        kind: Kind,
    ) -> SubscriptionHandle {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            sid,
            Entry {
                subject: subject.clone(),
                queue_group: queue_group.clone(),
                kind,
            },
        );
        self.enqueue(Command::Subscribe(SubscribeEntry {
            sid,
            subject,
            queue_group,
        }));
        SubscriptionHandle {
            sid,
            registry: self.clone(),
        }
    }

    /// Remove a subscription and enqueue `UNSUB`. Called by
    /// `SubscriptionHandle::drop` and available directly for explicit
    /// unsubscribe.
    pub fn remove(&self, sid: u64) {
        if self.entries.lock().remove(&sid).is_some() {
            self.enqueue(Command::Unsubscribe { sid });
        }
    }

    /// Snapshot of active subscriptions, used to rebuild `SubscribeBatch` on
    /// reconnect.
    #[must_use]
    pub fn list_for_replay(&self) -> Vec<SubscribeEntry> {
        self.entries
            .lock()
            .iter()
            .map(|(sid, entry)| SubscribeEntry {
                sid: *sid,
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
            })
            .collect()
    }

    /// Dispatch an inbound message by sid. Unknown sids are logged and
    /// dropped (the server may still be delivering to a subscription that
    /// raced an in-flight `UNSUB`). Handler panics are caught here so a
    /// misbehaving callback can never take down the reader loop.
    pub fn dispatch(&self, msg: InboundMessage) {
        let kind = {
            let entries = self.entries.lock();
            match entries.get(&msg.sid) {
                Some(entry) => match &entry.kind {
                    Kind::Plain(h) => Some(Kind::Plain(h.clone())),
                    Kind::Request(h) => Some(Kind::Request(h.clone())),
                },
                None => None,
            }
        };

        match kind {
            Some(Kind::Plain(handler)) => {
                let sid = msg.sid;
                if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                    error!(sid, "subscription handler panicked");
                }
            }
            Some(Kind::Request(handler)) => self.dispatch_as_request(handler, msg),
            None => warn!(sid = msg.sid, "dispatch for unknown subscription id"),
        }
    }

    fn dispatch_as_request(&self, handler: RequestHandler, msg: InboundMessage) {
        let reply_to = msg.reply_to.clone();
        let sid = msg.sid;
        let result = catch_unwind(AssertUnwindSafe(|| handler(msg)));
        let response = match result {
            Ok(response) => response,
            Err(_) => {
                error!(sid, "request handler panicked");
                return;
            }
        };
        let (Some(payload), Some(reply_to)) = (response, reply_to) else {
            return;
        };
        let subject = String::from_utf8_lossy(&reply_to).into_owned();
        self.enqueue(Command::Publish(PublishEntry {
            subject,
            reply_to: None,
            headers: None,
            payload,
        }));
    }

    /// Remove every subscription without enqueueing `UNSUB` (the socket is
    /// already gone).
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    fn enqueue(&self, command: Command) {
        let slot = rent_command(&self.pool, command, None);
        // The writer loop outliving every subscriber is an invariant of the
        // connection's shutdown order (§5); a closed queue here means the
        // connection is already disposed and there is nothing useful to do.
        let _ = self.queue_tx.send(slot);
    }
}

impl Clone for Kind {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(h) => Self::Plain(h.clone()),
            Self::Request(h) => Self::Request(h.clone()),
        }
    }
}

/// A disposable handle returned from `add`/`add_request_handler`: on drop,
/// removes the entry and enqueues `UNSUB`.
pub struct SubscriptionHandle {
    sid: u64,
    registry: Arc<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    #[must_use]
    pub const fn sid(&self) -> u64 {
        self.sid
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.registry.remove(self.sid);
    }
}
