//! Protocol reader loop (§4.3, §4.7 inbound half).
//!
//! Sole consumer of the socket's read side: pulls bytes into a
//! `SegmentedBuffer` via the zero-copy `IoArena`, drives the `NatsDecoder`,
//! and dispatches decoded `ServerOp`s to the subscription/request registries
//! or the handshake signals. Like the writer, this has exactly one thing to
//! wait on (the socket), so there is no multiplexed busy-poll here either.

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt};
use nats_core::alloc::IoArena;
use nats_core::buffer::SegmentedBuffer;
use nats_core::error::NatsError;
use nats_core::signal::Signal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::{NatsDecoder, ServerOp};
use crate::command::{rent_command, Command, CommandPool, CommandQueueSender};
use crate::ping::PingRegistry;
use crate::serverinfo::ServerInfo;
use crate::subscription::{InboundMessage, SubscriptionRegistry};

const READ_CHUNK_SIZE: usize = 8192;

/// `Signal<T>` requires `T: Clone`; `NatsError` is not (it wraps
/// `io::Error`), so the handshake outcome is carried as this small Clone-able
/// enum instead of `Result<(), NatsError>` directly.
#[derive(Debug, Clone)]
pub enum HandshakeOutcome {
    Ready,
    Rejected(String),
}

/// Shared handshake/keepalive signals and registries the reader loop reports
/// into. Constructed once per connection and reused across reconnects; only
/// the socket and the loop task bound to it are replaced.
pub struct ReaderContext {
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub queue_tx: CommandQueueSender,
    pub pool: Arc<CommandPool>,
    pub info_signal: Signal<Arc<ServerInfo>>,
    pub pong_or_error_signal: Signal<HandshakeOutcome>,
    pub last_info: parking_lot::Mutex<Option<Arc<ServerInfo>>>,
    pub outstanding_pings: AtomicU32,
    pub handshake_complete: std::sync::atomic::AtomicBool,
    /// RTT tracking for user `ping()` calls (§4.7); independent of the
    /// keepalive watchdog's `outstanding_pings` counter above.
    pub ping_registry: Arc<PingRegistry>,
}

impl ReaderContext {
    #[must_use]
    pub fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        queue_tx: CommandQueueSender,
        pool: Arc<CommandPool>,
    ) -> Self {
        Self {
            subscriptions,
            queue_tx,
            pool,
            info_signal: Signal::new(),
            pong_or_error_signal: Signal::new(),
            last_info: parking_lot::Mutex::new(None),
            outstanding_pings: AtomicU32::new(0),
            handshake_complete: std::sync::atomic::AtomicBool::new(false),
            ping_registry: Arc::new(PingRegistry::new()),
        }
    }

    /// Reset the per-socket handshake signals ahead of a new connect or
    /// reconnect attempt.
    pub fn begin_handshake(&self) {
        self.info_signal.reset();
        self.pong_or_error_signal.reset();
        self.handshake_complete.store(false, Ordering::SeqCst);
        self.outstanding_pings.store(0, Ordering::SeqCst);
    }

    fn enqueue(&self, command: Command) {
        let slot = rent_command(&self.pool, command, None);
        let _ = self.queue_tx.send(slot);
    }
}

/// Runs until the socket is closed or yields a protocol error. The caller
/// treats either outcome as "this socket is dead, reconnect".
pub async fn run_reader_loop<S>(socket: S, ctx: Arc<ReaderContext>) -> Result<(), NatsError>
where
    S: AsyncRead + Unpin,
{
    run_reader_loop_from(socket, ctx, bytes::Bytes::new()).await
}

/// Same as `run_reader_loop`, but seeds the decoder with bytes already
/// consumed off the wire before this loop was spawned (the TLS upgrade
/// decision peeks the plaintext INFO line over the same socket; anything
/// read past it is handed back here instead of being dropped).
pub async fn run_reader_loop_from<S>(
    mut socket: S,
    ctx: Arc<ReaderContext>,
    prefill: bytes::Bytes,
) -> Result<(), NatsError>
where
    S: AsyncRead + Unpin,
{
    let mut arena = IoArena::new();
    let mut buffer = SegmentedBuffer::new();
    let mut decoder = NatsDecoder::new();

    if !prefill.is_empty() {
        buffer.push(prefill);
        while let Some(op) = decoder.decode(&mut buffer)? {
            handle_op(&ctx, op)?;
        }
    }

    loop {
        let slab = arena.alloc_mut(READ_CHUNK_SIZE);
        let BufResult(result, slab) = socket.read(slab).await;
        let n = result.map_err(NatsError::Io)?;
        if n == 0 {
            return Err(NatsError::ConnectionLost);
        }
        buffer.push(slab.freeze());

        while let Some(op) = decoder.decode(&mut buffer)? {
            handle_op(&ctx, op)?;
        }
    }
}

fn handle_op(ctx: &Arc<ReaderContext>, op: ServerOp) -> Result<(), NatsError> {
    match op {
        ServerOp::Info(json) => {
            let info = ServerInfo::parse(&json)
                .map_err(|e| NatsError::protocol(format!("malformed INFO: {e}")))?;
            let info = Arc::new(info);
            *ctx.last_info.lock() = Some(info.clone());
            ctx.info_signal.complete(info);
        }
        ServerOp::Ping => {
            ctx.enqueue(Command::Pong);
        }
        ServerOp::Pong => {
            let prev = ctx.outstanding_pings.load(Ordering::SeqCst);
            if prev > 0 {
                ctx.outstanding_pings.fetch_sub(1, Ordering::SeqCst);
            }
            ctx.ping_registry.complete_oldest();
            if !ctx.handshake_complete.swap(true, Ordering::SeqCst) {
                ctx.pong_or_error_signal.complete(HandshakeOutcome::Ready);
            }
        }
        ServerOp::Ok => {}
        ServerOp::Err(message) => {
            let err = NatsError::from_server_err(&message);
            if !ctx.handshake_complete.swap(true, Ordering::SeqCst) {
                ctx.pong_or_error_signal
                    .complete(HandshakeOutcome::Rejected(message.clone()));
            }
            warn!(error = %message, "server reported -ERR");
            if err.is_connection_fatal() {
                return Err(err);
            }
        }
        ServerOp::Msg {
            subject,
            sid,
            reply_to,
            payload,
        } => dispatch_message(ctx, subject, sid, reply_to, None, payload),
        ServerOp::Hmsg {
            subject,
            sid,
            reply_to,
            headers,
            payload,
        } => dispatch_message(ctx, subject, sid, reply_to, Some(headers), payload),
    }
    Ok(())
}

/// The request/response registry's wildcard inbox subscription is an
/// ordinary entry in `subscriptions`, so plain sid-based dispatch already
/// routes replies to the right waiter; no separate request-dispatch path is
/// needed here.
fn dispatch_message(
    ctx: &Arc<ReaderContext>,
    subject: bytes::Bytes,
    sid: u64,
    reply_to: Option<bytes::Bytes>,
    headers: Option<bytes::Bytes>,
    payload: bytes::Bytes,
) {
    let msg = InboundMessage {
        subject,
        sid,
        reply_to,
        headers,
        payload,
    };
    debug!(sid, subject = %String::from_utf8_lossy(&msg.subject), "dispatching inbound message");
    ctx.subscriptions.dispatch(msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{new_command_pool, CommandSlot};
    use bytes::Bytes;
    use compio::buf::{IoBufMut, SetBufInit};
    use std::sync::Mutex;

    struct ChunkedSource {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl compio::io::AsyncRead for ChunkedSource {
        async fn read<B: IoBufMut>(&mut self, mut buf: B) -> BufResult<usize, B> {
            let mut guard = self.chunks.lock().unwrap();
            if guard.is_empty() {
                return BufResult(Ok(0), buf);
            }
            let chunk = guard.remove(0);
            let slice = unsafe {
                std::slice::from_raw_parts_mut(buf.as_buf_mut_ptr(), buf.buf_capacity())
            };
            let n = chunk.len().min(slice.len());
            slice[..n].copy_from_slice(&chunk[..n]);
            unsafe { buf.set_buf_init(n) };
            BufResult(Ok(n), buf)
        }
    }

    fn harness() -> (Arc<ReaderContext>, flume::Receiver<nats_core::pool::Rented<CommandSlot>>) {
        let (tx, rx) = flume::unbounded();
        let pool = new_command_pool(8);
        let subs = SubscriptionRegistry::new(tx.clone(), pool.clone());
        let ctx = Arc::new(ReaderContext::new(subs, tx, pool));
        (ctx, rx)
    }

    #[test]
    fn ping_enqueues_pong() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let (ctx, rx) = harness();
            let source = ChunkedSource {
                chunks: Mutex::new(vec![b"PING\r\n".to_vec()]),
            };
            let result = run_reader_loop(source, ctx).await;
            assert!(matches!(result, Err(NatsError::ConnectionLost)));
            let slot = rx.try_recv().expect("Pong enqueued");
            assert!(matches!(slot.command, Command::Pong));
        });
    }

    #[test]
    fn info_completes_handshake_signal() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let (ctx, _rx) = harness();
            let ctx2 = ctx.clone();
            let source = ChunkedSource {
                chunks: Mutex::new(vec![b"INFO {\"server_id\":\"n1\"}\r\n".to_vec()]),
            };
            let reader = compio::runtime::spawn(async move {
                let _ = run_reader_loop(source, ctx2).await;
            });
            let info = ctx.info_signal.wait().await.unwrap();
            assert_eq!(info.server_id, "n1");
            reader.await;
        });
    }

    #[test]
    fn msg_split_across_reads_dispatches_once() {
        compio::runtime::Runtime::new().unwrap().block_on(async {
            let (ctx, _rx) = harness();
            let received = Arc::new(Mutex::new(Vec::new()));
            let received2 = received.clone();
            let _handle = ctx
                .subscriptions
                .add("s", None, Arc::new(move |m: InboundMessage| {
                    received2.lock().unwrap().push(m.payload)
                }));

            let source = ChunkedSource {
                chunks: Mutex::new(vec![b"MSG s 1 5\r\nhel".to_vec(), b"lo\r\n".to_vec()]),
            };
            let result = run_reader_loop(source, ctx).await;
            assert!(matches!(result, Err(NatsError::ConnectionLost)));
            assert_eq!(received.lock().unwrap().as_slice(), [Bytes::from_static(b"hello")]);
        });
    }
}
