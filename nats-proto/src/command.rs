//! Outbound protocol commands.
//!
//! `Command` is a tagged variant with a single `serialize` operation, not a
//! trait object — matching this codebase's existing taste for sans-IO framing
//! (`ZmtpFrame`/`encode_multipart` before it) over runtime polymorphism.
//!
//! Each command rented from the pool carries an optional one-shot completion
//! that the writer loop fires once the bytes containing it have been handed
//! to the socket successfully (§4.2 invariant 4).

use bytes::{Bytes, BytesMut};
use futures::channel::oneshot;
use nats_core::error::NatsError;
use nats_core::pool::Pool;
use std::sync::Arc;

use crate::serverinfo::ConnectArgs;

/// A single subscription entry as replayed on reconnect.
#[derive(Debug, Clone)]
pub struct SubscribeEntry {
    pub sid: u64,
    pub subject: String,
    pub queue_group: Option<String>,
}

/// A single publish entry, used both standalone and batched.
#[derive(Debug, Clone)]
pub struct PublishEntry {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Option<Bytes>,
    pub payload: Bytes,
}

/// Outbound protocol command.
#[derive(Debug, Clone)]
pub enum Command {
    Connect(Arc<ConnectArgs>),
    Ping,
    Pong,
    Publish(PublishEntry),
    PublishBatch(Vec<PublishEntry>),
    Subscribe(SubscribeEntry),
    SubscribeBatch(Vec<SubscribeEntry>),
    Unsubscribe { sid: u64 },
    /// Escape hatch for arbitrary protocol bytes (§6 `direct-write`).
    DirectWrite { bytes: Bytes, repeat: usize },
}

impl Command {
    /// Serialize this command onto the shared write buffer.
    ///
    /// # Errors
    ///
    /// Returns an error only for `Connect`, whose JSON encoding can fail if
    /// credentials contain data `serde_json` rejects (never, in practice, but
    /// the fallibility is preserved rather than panicking).
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<(), NatsError> {
        match self {
            Self::Connect(args) => {
                let json = args
                    .to_json()
                    .map_err(|e| NatsError::protocol(format!("CONNECT encode: {e}")))?;
                buf.extend_from_slice(b"CONNECT ");
                buf.extend_from_slice(&json);
                buf.extend_from_slice(b"\r\n");
            }
            Self::Ping => buf.extend_from_slice(b"PING\r\n"),
            Self::Pong => buf.extend_from_slice(b"PONG\r\n"),
            Self::Publish(entry) => write_pub(buf, entry),
            Self::PublishBatch(entries) => {
                for entry in entries {
                    write_pub(buf, entry);
                }
            }
            Self::Subscribe(entry) => write_sub(buf, entry),
            Self::SubscribeBatch(entries) => {
                for entry in entries {
                    write_sub(buf, entry);
                }
            }
            Self::Unsubscribe { sid } => {
                buf.extend_from_slice(b"UNSUB ");
                buf.extend_from_slice(sid.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Self::DirectWrite { bytes, repeat } => {
                for _ in 0..(*repeat).max(1) {
                    buf.extend_from_slice(bytes);
                }
            }
        }
        Ok(())
    }
}

fn write_pub(buf: &mut BytesMut, entry: &PublishEntry) {
    if let Some(headers) = &entry.headers {
        buf.extend_from_slice(b"HPUB ");
        buf.extend_from_slice(entry.subject.as_bytes());
        buf.extend_from_slice(b" ");
        if let Some(reply_to) = &entry.reply_to {
            buf.extend_from_slice(reply_to.as_bytes());
            buf.extend_from_slice(b" ");
        }
        let total_len = headers.len() + entry.payload.len();
        buf.extend_from_slice(headers.len().to_string().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(total_len.to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(headers);
        buf.extend_from_slice(&entry.payload);
        buf.extend_from_slice(b"\r\n");
    } else {
        buf.extend_from_slice(b"PUB ");
        buf.extend_from_slice(entry.subject.as_bytes());
        buf.extend_from_slice(b" ");
        if let Some(reply_to) = &entry.reply_to {
            buf.extend_from_slice(reply_to.as_bytes());
            buf.extend_from_slice(b" ");
        }
        buf.extend_from_slice(entry.payload.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&entry.payload);
        buf.extend_from_slice(b"\r\n");
    }
}

fn write_sub(buf: &mut BytesMut, entry: &SubscribeEntry) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(entry.subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(group) = &entry.queue_group {
        buf.extend_from_slice(group.as_bytes());
        buf.extend_from_slice(b" ");
    }
    buf.extend_from_slice(entry.sid.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

pub type CommandCompletion = oneshot::Sender<Result<(), NatsError>>;

/// The persistent, lock-free MPSC command queue (§3 `WriterState`). Survives
/// reconnects; only the socket and the loops bound to it are torn down.
pub type CommandQueueSender = flume::Sender<nats_core::pool::Rented<CommandSlot>>;
pub type CommandQueueReceiver = flume::Receiver<nats_core::pool::Rented<CommandSlot>>;

/// Rentable pool slot: a command plus its optional completion.
pub struct CommandSlot {
    pub command: Command,
    pub completion: Option<CommandCompletion>,
}

impl CommandSlot {
    const fn empty() -> Self {
        Self {
            command: Command::Pong,
            completion: None,
        }
    }
}

pub type CommandPool = Pool<CommandSlot>;

#[must_use]
pub fn new_command_pool(max_size: usize) -> Arc<CommandPool> {
    CommandPool::new(max_size)
}

/// Rent a slot, fill it in, and return it ready for the writer queue.
pub fn rent_command(
    pool: &Arc<CommandPool>,
    command: Command,
    completion: Option<CommandCompletion>,
) -> nats_core::pool::Rented<CommandSlot> {
    let mut slot = pool.rent(CommandSlot::empty);
    slot.command = command;
    slot.completion = completion;
    slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_reply_or_headers() {
        let mut buf = BytesMut::new();
        let entry = PublishEntry {
            subject: "x".into(),
            reply_to: None,
            headers: None,
            payload: Bytes::from_static(b"hello"),
        };
        Command::Publish(entry).serialize(&mut buf).unwrap();
        assert_eq!(&buf[..], b"PUB x 5\r\nhello\r\n");
    }

    #[test]
    fn publish_with_reply_to() {
        let mut buf = BytesMut::new();
        let entry = PublishEntry {
            subject: "svc".into(),
            reply_to: Some("_INBOX.abc.1".into()),
            headers: None,
            payload: Bytes::from_static(b"ping"),
        };
        Command::Publish(entry).serialize(&mut buf).unwrap();
        assert_eq!(&buf[..], b"PUB svc _INBOX.abc.1 4\r\nping\r\n");
    }

    #[test]
    fn hpub_includes_header_and_total_length() {
        let mut buf = BytesMut::new();
        let entry = PublishEntry {
            subject: "x".into(),
            reply_to: None,
            headers: Some(Bytes::from_static(b"NATS/1.0\r\n\r\n")),
            payload: Bytes::from_static(b"hi"),
        };
        Command::Publish(entry).serialize(&mut buf).unwrap();
        assert_eq!(&buf[..], b"HPUB x 12 14\r\nNATS/1.0\r\n\r\nhi\r\n");
    }

    #[test]
    fn subscribe_with_queue_group() {
        let mut buf = BytesMut::new();
        let entry = SubscribeEntry {
            sid: 7,
            subject: "orders.*".into(),
            queue_group: Some("workers".into()),
        };
        Command::Subscribe(entry).serialize(&mut buf).unwrap();
        assert_eq!(&buf[..], b"SUB orders.* workers 7\r\n");
    }

    #[test]
    fn unsubscribe_writes_sid() {
        let mut buf = BytesMut::new();
        Command::Unsubscribe { sid: 3 }.serialize(&mut buf).unwrap();
        assert_eq!(&buf[..], b"UNSUB 3\r\n");
    }

    #[test]
    fn pooled_slot_reuses_and_bumps_generation() {
        let pool = new_command_pool(4);
        let first_gen = {
            let slot = rent_command(&pool, Command::Ping, None);
            slot.generation()
        };
        let second = rent_command(&pool, Command::Pong, None);
        assert!(second.generation() > first_gen);
    }
}
