//! Connection handshake (§4.6).
//!
//! Runs once per connect attempt, whether the very first connect or a
//! reconnect round: open the socket (with the TLS upgrade decision folded
//! in), start the reader/writer loops bound to it, and walk through
//! INFO → CONNECT → PING/PONG (plus subscription replay on reconnect)
//! before the caller is told the connection is open.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use compio::time::timeout;
use futures::channel::oneshot;
use nats_core::endpoint::Endpoint;
use nats_core::error::NatsError;
use nats_core::options::{ConnectOptions, TlsMode};
use nats_core::socket::{self, AbortHandle, ReadHalf, WriteHalf};
use tracing::debug;

use crate::command::{rent_command, Command, CommandPool, CommandQueueReceiver};
use crate::reader::{run_reader_loop_from, HandshakeOutcome, ReaderContext};
use crate::serverinfo::{ConnectArgs, ServerInfo};
use crate::subscription::SubscriptionRegistry;
use crate::writer::{run_writer_loop, WriterConfig};

/// Everything the session needs to hold on to once a handshake succeeds.
pub struct Established {
    pub reader_task: compio::runtime::Task<Result<(), NatsError>>,
    pub writer_task: compio::runtime::Task<Result<(), NatsError>>,
    pub abort: Arc<AbortHandle>,
    pub server_info: Arc<ServerInfo>,
}

/// Runs one full handshake attempt against `endpoint`. `ctx` is the
/// connection's persistent reader context (its handshake signals are reset
/// at the start of this call); `is_reconnect` controls whether subscription
/// replay is folded into the priority lane (step 3/6).
pub async fn run(
    endpoint: &Endpoint,
    options: &ConnectOptions,
    ctx: &Arc<ReaderContext>,
    subscriptions: &Arc<SubscriptionRegistry>,
    queue_rx: CommandQueueReceiver,
    pool: &Arc<CommandPool>,
    is_reconnect: bool,
) -> Result<Established, NatsError> {
    ctx.begin_handshake();

    let tcp = socket::connect_tcp(endpoint, options.connect_timeout).await?;
    let abort = Arc::new(AbortHandle::new(&tcp));

    let (read_half, write_half, tls_required, reader_prefill) =
        establish_stream(tcp, endpoint, options, ctx).await?;

    let reader_task = compio::runtime::spawn(run_reader_loop_from(
        read_half,
        ctx.clone(),
        reader_prefill,
    ));

    let mut priority = Vec::new();
    let (connect_tx, connect_rx) = oneshot::channel();
    priority.push(rent_command(
        pool,
        Command::Connect(Arc::new(ConnectArgs::new(
            &options.credentials,
            tls_required,
            options.echo,
        ))),
        Some(connect_tx),
    ));
    priority.push(rent_command(pool, Command::Ping, None));

    let subscribe_rx = if is_reconnect {
        let replay = subscriptions.list_for_replay();
        if replay.is_empty() {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            priority.push(rent_command(pool, Command::SubscribeBatch(replay), Some(tx)));
            Some(rx)
        }
    } else {
        None
    };

    let writer_task = compio::runtime::spawn(run_writer_loop(
        write_half,
        priority,
        queue_rx,
        WriterConfig {
            write_high_water_mark: options.write_high_water_mark,
        },
    ));

    if let Err(e) = drive_handshake(ctx, connect_rx, subscribe_rx, options.connect_timeout).await {
        abort.abort();
        return Err(e);
    }

    let server_info = ctx
        .last_info
        .lock()
        .clone()
        .expect("info_signal completed implies last_info is set");

    debug!(server = %endpoint, "handshake complete");

    Ok(Established {
        reader_task,
        writer_task,
        abort,
        server_info,
    })
}

async fn drive_handshake(
    ctx: &Arc<ReaderContext>,
    connect_rx: oneshot::Receiver<Result<(), NatsError>>,
    subscribe_rx: Option<oneshot::Receiver<Result<(), NatsError>>>,
    connect_timeout: Duration,
) -> Result<(), NatsError> {
    await_with_timeout(ctx.info_signal.wait(), connect_timeout, "info").await?;

    await_completion(connect_rx, connect_timeout, "connect").await?;

    match await_with_timeout(ctx.pong_or_error_signal.wait(), connect_timeout, "pong").await? {
        HandshakeOutcome::Ready => {}
        HandshakeOutcome::Rejected(message) => return Err(NatsError::from_server_err(&message)),
    }

    if let Some(rx) = subscribe_rx {
        await_completion(rx, connect_timeout, "subscribe replay").await?;
    }

    Ok(())
}

async fn await_with_timeout<T: Clone>(
    fut: futures::future::Shared<oneshot::Receiver<T>>,
    duration: Duration,
    what: &str,
) -> Result<T, NatsError> {
    match timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_canceled)) => Err(NatsError::handshake(format!("{what} signal dropped"))),
        Err(_elapsed) => Err(NatsError::handshake(format!("timed out waiting for {what}"))),
    }
}

async fn await_completion(
    rx: oneshot::Receiver<Result<(), NatsError>>,
    duration: Duration,
    what: &str,
) -> Result<(), NatsError> {
    match timeout(duration, rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_canceled)) => Err(NatsError::handshake(format!("{what} completion dropped"))),
        Err(_elapsed) => Err(NatsError::handshake(format!("timed out waiting for {what}"))),
    }
}

/// Resolves the TLS upgrade decision and returns the split halves ready for
/// the reader/writer loops: whether TLS ended up in effect (for the
/// `tls_required` field CONNECT reports back), and any plaintext bytes
/// read past the INFO line that the reader loop still needs to decode.
///
/// Auto/Prefer/Require consume the server's first INFO line off the raw
/// socket to learn `tls_required` before deciding whether to upgrade. That
/// INFO frame is gone by the time the reader loop starts (there is no
/// second INFO to decode, TLS or not), so `ctx.info_signal`/`ctx.last_info`
/// are completed here directly from the already-parsed value rather than
/// relying on the reader to see it again.
async fn establish_stream(
    tcp: compio::net::TcpStream,
    endpoint: &Endpoint,
    options: &ConnectOptions,
    ctx: &Arc<ReaderContext>,
) -> Result<(ReadHalf, WriteHalf, bool, Bytes), NatsError> {
    if socket::is_implicit_tls(options.tls_mode, endpoint) {
        let tls = socket::upgrade_tls(tcp, endpoint, &options.tls_options, &[]).await?;
        let (r, w) = socket::split_tls(tls)?;
        return Ok((r, w, true, Bytes::new()));
    }

    if options.tls_mode == TlsMode::Disable {
        let (r, w) = socket::split_plain(tcp)?;
        return Ok((r, w, false, Bytes::new()));
    }

    // Auto/Prefer/Require: peek the plaintext INFO line to learn
    // `tls_required` before deciding whether to upgrade.
    let (tcp, info, leftover) = peek_info_line(tcp).await?;
    let info = Arc::new(info);
    *ctx.last_info.lock() = Some(info.clone());
    ctx.info_signal.complete(info.clone());

    if socket::should_upgrade(options.tls_mode, info.tls_required)? {
        let tls = socket::upgrade_tls(tcp, endpoint, &options.tls_options, &leftover).await?;
        let (r, w) = socket::split_tls(tls)?;
        Ok((r, w, true, Bytes::new()))
    } else {
        let (r, w) = socket::split_plain(tcp)?;
        Ok((r, w, false, Bytes::copy_from_slice(&leftover)))
    }
}

/// Reads and decodes exactly the first `INFO <json>\r\n` line off a fresh
/// plaintext socket, returning the socket, the parsed info, and any bytes
/// read past the line's terminator (normally empty: the server does not
/// pipeline anything else before the client's next move).
async fn peek_info_line(
    mut tcp: compio::net::TcpStream,
) -> Result<(compio::net::TcpStream, ServerInfo, Vec<u8>), NatsError> {
    use compio::io::AsyncRead;
    use nats_core::alloc::IoArena;
    use nats_core::buffer::SegmentedBuffer;

    use crate::codec::{NatsDecoder, ServerOp};

    let mut arena = IoArena::new();
    let mut buffer = SegmentedBuffer::new();
    let mut decoder = NatsDecoder::new();

    loop {
        let slab = arena.alloc_mut(512);
        let compio::buf::BufResult(result, slab) = tcp.read(slab).await;
        let n = result.map_err(NatsError::Io)?;
        if n == 0 {
            return Err(NatsError::handshake(
                "connection closed before INFO was received",
            ));
        }
        buffer.push(slab.freeze());

        if let Some(op) = decoder.decode(&mut buffer)? {
            return match op {
                ServerOp::Info(json) => {
                    let info = ServerInfo::parse(&json)
                        .map_err(|e| NatsError::protocol(format!("malformed INFO: {e}")))?;
                    let leftover = buffer
                        .take_bytes(buffer.len())
                        .unwrap_or_default()
                        .to_vec();
                    Ok((tcp, info, leftover))
                }
                other => Err(NatsError::protocol(format!(
                    "expected INFO as first server frame, got {other:?}"
                ))),
            };
        }
    }
}
