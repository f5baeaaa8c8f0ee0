//! The public `Connection` state machine (§4.1/§4.6/§4.7 of the connection-core
//! design): owns the lifecycle lock, the persistent command queue and
//! registries, and the reconnect supervisor that replaces the socket and its
//! reader/writer loops transparently while Subscriptions and in-flight
//! requests survive underneath it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nats_core::endpoint::Endpoint;
use nats_core::error::NatsError;
use nats_core::options::ConnectOptions;
use nats_core::reconnect::{jittered_delay, ReconnectCandidates};
use nats_core::signal::Signal;
use nats_core::socket::AbortHandle;
use nats_proto::command::{
    new_command_pool, rent_command, Command, CommandPool, CommandQueueSender, PublishEntry,
};
use nats_proto::handshake::{self, Established};
use nats_proto::reader::ReaderContext;
use nats_proto::request::{RequestFuture, RequestRegistry};
use nats_proto::serverinfo::ServerInfo;
use nats_proto::subscription::{Handler, RequestHandler, SubscriptionHandle, SubscriptionRegistry};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Bounded window dispose() gives the writer to flush whatever is already
/// queued before the socket is forced closed (§5).
const DISPOSE_DRAIN_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateTag {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

/// A live socket plus the tasks bound to it: the reader/writer loops and the
/// keepalive ping timer. Replaced wholesale on every reconnect.
struct Session {
    reader_task: compio::runtime::Task<Result<(), NatsError>>,
    writer_task: compio::runtime::Task<Result<(), NatsError>>,
    ping_task: compio::runtime::Task<()>,
    abort: Arc<AbortHandle>,
    server_info: Arc<ServerInfo>,
    endpoint: Endpoint,
}

struct Inner {
    options: ConnectOptions,
    state: Mutex<StateTag>,
    session: Mutex<Option<Session>>,
    supervisor: Mutex<Option<compio::runtime::Task<()>>>,
    open_signal: Signal<Result<(), Arc<NatsError>>>,
    subscriptions: Arc<SubscriptionRegistry>,
    requests: Arc<RequestRegistry>,
    ctx: Arc<ReaderContext>,
    pool: Arc<CommandPool>,
    queue_tx: CommandQueueSender,
    queue_rx: nats_proto::command::CommandQueueReceiver,
    disposed: AtomicBool,
}

/// A single NATS connection: the reconnecting, pipelining, ping-keepalived
/// client core (§2). Cheap to clone — every clone shares the same
/// connection state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Build a connection object in the `Closed` state. No I/O happens until
    /// [`Connection::connect`] is called.
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        let pool = new_command_pool(options.command_pool_size);
        let subscriptions = SubscriptionRegistry::new(queue_tx.clone(), pool.clone());
        let requests = RequestRegistry::new(
            format!("{}{}.", options.inbox_prefix, inbox_nonce()),
            subscriptions.clone(),
            queue_tx.clone(),
            pool.clone(),
        );
        let ctx = Arc::new(ReaderContext::new(subscriptions.clone(), queue_tx.clone(), pool.clone()));

        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(StateTag::Closed),
                session: Mutex::new(None),
                supervisor: Mutex::new(None),
                open_signal: Signal::new(),
                subscriptions,
                requests,
                ctx,
                pool,
                queue_tx,
                queue_rx,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Idempotent connect: the first caller on a `Closed` connection drives
    /// the attempt; concurrent callers share its outcome (§4.1).
    pub async fn connect(&self) -> Result<(), NatsError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(NatsError::Disposed);
        }

        let should_drive = {
            let mut state = self.inner.state.lock();
            match *state {
                StateTag::Closed => {
                    *state = StateTag::Connecting;
                    true
                }
                StateTag::Open => return Ok(()),
                StateTag::Connecting | StateTag::Reconnecting => false,
            }
        };

        if !should_drive {
            return self.await_open().await;
        }

        self.inner.open_signal.reset();

        let mut candidates =
            ReconnectCandidates::build(&self.inner.options, &[], None);
        match attempt_round(&self.inner, &mut candidates, false).await {
            Ok((endpoint, established)) => {
                self.become_open(endpoint, established);
                self.inner.open_signal.complete(Ok(()));
                Ok(())
            }
            Err(err) => {
                *self.inner.state.lock() = StateTag::Closed;
                let shared = Arc::new(err);
                self.inner.open_signal.complete(Err(shared.clone()));
                Err(unwrap_shared(shared))
            }
        }
    }

    async fn await_open(&self) -> Result<(), NatsError> {
        match self.inner.open_signal.wait().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(shared)) => Err(unwrap_shared(shared)),
            Err(_canceled) => Err(NatsError::ConnectionLost),
        }
    }

    fn become_open(&self, endpoint: Endpoint, established: Established) {
        let abort = established.abort.clone();
        let ping_task = spawn_ping_task(self.inner.clone(), abort.clone());
        *self.inner.session.lock() = Some(Session {
            reader_task: established.reader_task,
            writer_task: established.writer_task,
            ping_task,
            abort,
            server_info: established.server_info,
            endpoint,
        });
        *self.inner.state.lock() = StateTag::Open;

        let mut supervisor_guard = self.inner.supervisor.lock();
        if supervisor_guard.is_none() {
            let inner = self.inner.clone();
            *supervisor_guard = Some(compio::runtime::spawn(run_supervisor(inner)));
        }
    }

    /// Publish without waiting for the write to reach the socket
    /// (fire-and-forget variant of §6 `publish`).
    pub fn publish(&self, subject: impl Into<String>, payload: Bytes) -> Result<(), NatsError> {
        self.publish_entry(PublishEntry {
            subject: subject.into(),
            reply_to: None,
            headers: None,
            payload,
        })
    }

    /// Publish and await the write's completion (async variant of §6
    /// `publish`).
    pub fn publish_confirmed(
        &self,
        subject: impl Into<String>,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), NatsError>> + 'static {
        let slot_rx = self.publish_entry_confirmed(PublishEntry {
            subject: subject.into(),
            reply_to: None,
            headers: None,
            payload,
        });
        async move {
            let rx = slot_rx?;
            match rx.await {
                Ok(result) => result,
                Err(_canceled) => Err(NatsError::ConnectionLost),
            }
        }
    }

    /// Publish with headers attached (`HPUB`), fire-and-forget.
    pub fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: Bytes,
        payload: Bytes,
    ) -> Result<(), NatsError> {
        self.publish_entry(PublishEntry {
            subject: subject.into(),
            reply_to: None,
            headers: Some(headers),
            payload,
        })
    }

    /// A single write of many `PUB`/`HPUB` entries, fire-and-forget.
    pub fn publish_batch(&self, entries: Vec<PublishEntry>) -> Result<(), NatsError> {
        self.enqueue(Command::PublishBatch(entries), None)
    }

    /// A single write of many `PUB`/`HPUB` entries, awaiting completion of
    /// the whole batch.
    pub fn publish_batch_confirmed(
        &self,
        entries: Vec<PublishEntry>,
    ) -> impl Future<Output = Result<(), NatsError>> + 'static {
        let (tx, rx) = futures::channel::oneshot::channel();
        let result = self.enqueue(Command::PublishBatch(entries), Some(tx));
        async move {
            result?;
            match rx.await {
                Ok(result) => result,
                Err(_canceled) => Err(NatsError::ConnectionLost),
            }
        }
    }

    fn publish_entry(&self, entry: PublishEntry) -> Result<(), NatsError> {
        self.enqueue(Command::Publish(entry), None)
    }

    fn publish_entry_confirmed(
        &self,
        entry: PublishEntry,
    ) -> Result<futures::channel::oneshot::Receiver<Result<(), NatsError>>, NatsError> {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.enqueue(Command::Publish(entry), Some(tx))?;
        Ok(rx)
    }

    /// Subscribe to `subject` (optionally within `queue_group`). Dropping the
    /// returned handle unsubscribes (§4.4 `add`).
    pub fn subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: Option<String>,
        handler: Handler,
    ) -> SubscriptionHandle {
        self.inner.subscriptions.add(subject, queue_group, handler)
    }

    /// Install a server-side request handler: for every inbound message, the
    /// handler's return value (if any) is published back to `reply_to`
    /// (§4.4 `add-request-handler`).
    pub fn subscribe_request(
        &self,
        subject: impl Into<String>,
        handler: RequestHandler,
    ) -> SubscriptionHandle {
        self.inner.subscriptions.add_request_handler(subject, handler)
    }

    /// Issue a request and await the response (§4.5).
    pub fn request(&self, subject: impl Into<String>, payload: Bytes) -> RequestFuture {
        self.inner.requests.add(subject, payload)
    }

    /// Measure a round-trip to the server. Resolves once the corresponding
    /// `PONG` arrives, or fails with `ConnectionLost` if the connection drops
    /// first (§4.7, §6 `ping`).
    pub async fn ping(&self) -> Result<Duration, NatsError> {
        let rx = self.inner.ctx.ping_registry.register();
        self.enqueue(Command::Ping, None)?;
        rx.await.map_err(|_| NatsError::ConnectionLost)
    }

    /// Escape hatch for arbitrary protocol bytes, fire-and-forget (§6
    /// `direct-write`).
    pub fn direct_write(&self, bytes: Bytes, repeat: usize) -> Result<(), NatsError> {
        self.enqueue(Command::DirectWrite { bytes, repeat }, None)
    }

    /// Escape hatch for arbitrary protocol bytes, awaiting the write's
    /// completion.
    pub fn direct_write_confirmed(
        &self,
        bytes: Bytes,
        repeat: usize,
    ) -> impl Future<Output = Result<(), NatsError>> + 'static {
        let (tx, rx) = futures::channel::oneshot::channel();
        let result = self.enqueue(Command::DirectWrite { bytes, repeat }, Some(tx));
        async move {
            result?;
            match rx.await {
                Ok(result) => result,
                Err(_canceled) => Err(NatsError::ConnectionLost),
            }
        }
    }

    /// Current server-advertised info for the socket in effect, if any.
    #[must_use]
    pub fn server_info(&self) -> Option<Arc<ServerInfo>> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.server_info.clone())
    }

    fn enqueue(
        &self,
        command: Command,
        completion: Option<nats_proto::command::CommandCompletion>,
    ) -> Result<(), NatsError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(NatsError::Disposed);
        }
        let slot = rent_command(&self.inner.pool, command, completion);
        self.inner
            .queue_tx
            .send(slot)
            .map_err(|_| NatsError::Disposed)
    }

    /// Graceful shutdown (§5): drains the writer within a bounded window,
    /// closes the socket, then drains the reader before returning. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.inner.state.lock() = StateTag::Closed;
        self.inner
            .open_signal
            .complete(Err(Arc::new(NatsError::Disposed)));
        self.inner.requests.reset();
        self.inner.ctx.ping_registry.clear();
        self.inner.subscriptions.clear_all();

        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            drop(supervisor);
        }

        let Some(session) = self.inner.session.lock().take() else {
            return;
        };

        compio::time::sleep(DISPOSE_DRAIN_WINDOW).await;
        session.abort.abort();
        let _ = session.writer_task.await;
        let _ = session.reader_task.await;
        drop(session.ping_task);
    }
}

fn unwrap_shared(shared: Arc<NatsError>) -> NatsError {
    Arc::try_unwrap(shared).unwrap_or_else(|shared| NatsError::Connect(shared.to_string()))
}

/// One full pass over `candidates`: tries each URL once via
/// [`handshake::run`], returning the first success. Returns the last error
/// observed once the list is exhausted without one.
async fn attempt_round(
    inner: &Arc<Inner>,
    candidates: &mut ReconnectCandidates,
    is_reconnect: bool,
) -> Result<(Endpoint, Established), NatsError> {
    let mut last_err = NatsError::connect("no reconnect candidates configured");
    loop {
        let Some(url) = candidates.next() else {
            return Err(last_err);
        };
        let url = url.to_string();

        let endpoint = match Endpoint::parse(&url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                last_err = NatsError::connect(e.to_string());
                if candidates.exhausted() {
                    return Err(last_err);
                }
                continue;
            }
        };

        debug!(server = %endpoint, is_reconnect, "attempting handshake");
        match handshake::run(
            &endpoint,
            &inner.options,
            &inner.ctx,
            &inner.subscriptions,
            queue_rx(inner),
            &inner.pool,
            is_reconnect,
        )
        .await
        {
            Ok(established) => return Ok((endpoint, established)),
            Err(e) => {
                warn!(server = %endpoint, error = %e, "handshake attempt failed");
                last_err = e;
                if candidates.exhausted() {
                    return Err(last_err);
                }
            }
        }
    }
}

/// Reconnect supervisor (§5, §9): one long-lived task that waits for the
/// current socket to die, tears it down, then retries candidates with
/// jittered backoff until a new handshake succeeds — looping rather than
/// respawning itself to avoid unbounded task chains.
async fn run_supervisor(inner: Arc<Inner>) {
    loop {
        let Some(session) = take_current_session(&inner) else {
            return;
        };

        let previous = session.endpoint.authority();
        let died = tear_down(session).await;
        if inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        warn!(error = %died, "connection lost, reconnecting");

        {
            let mut state = inner.state.lock();
            if *state == StateTag::Closed {
                return;
            }
            *state = StateTag::Reconnecting;
        }
        inner.open_signal.reset();
        inner.requests.reset();
        inner.ctx.ping_registry.clear();

        let advertised = inner
            .ctx
            .last_info
            .lock()
            .as_ref()
            .map(|info| info.connect_urls.clone())
            .unwrap_or_default();
        let mut candidates =
            ReconnectCandidates::build(&inner.options, &advertised, Some(&previous));

        let (endpoint, established) = loop {
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            match attempt_round(&inner, &mut candidates, true).await {
                Ok(established) => break established,
                Err(e) => {
                    warn!(error = %e, "reconnect round failed, will retry");
                    compio::time::sleep(jittered_delay(&inner.options)).await;
                }
            }
        };

        if inner.disposed.load(Ordering::SeqCst) {
            established.abort.abort();
            return;
        }

        let abort = established.abort.clone();
        let ping_task = spawn_ping_task(inner.clone(), abort.clone());
        *inner.session.lock() = Some(Session {
            reader_task: established.reader_task,
            writer_task: established.writer_task,
            ping_task,
            abort,
            server_info: established.server_info,
            endpoint,
        });
        *inner.state.lock() = StateTag::Open;
        inner.open_signal.complete(Ok(()));
    }
}

fn take_current_session(inner: &Arc<Inner>) -> Option<Session> {
    inner.session.lock().take()
}

/// Waits for either loop to end, aborts the socket so the other unblocks,
/// synchronously disposes the writer, and detaches the reader (§4.1: the
/// reader's state is not shared, so cancelling it on drop is safe; the
/// writer's buffer/queue would race a new writer, so it is awaited).
async fn tear_down(session: Session) -> NatsError {
    use futures::future::{select, Either};

    drop(session.ping_task);
    let outcome = match select(session.reader_task, session.writer_task).await {
        Either::Left((reader_result, writer_task)) => {
            session.abort.abort();
            let _ = writer_task.await;
            reader_result
        }
        Either::Right((writer_result, reader_task)) => {
            session.abort.abort();
            reader_task.detach();
            writer_result
        }
    };
    outcome.err().unwrap_or(NatsError::ConnectionLost)
}

fn spawn_ping_task(inner: Arc<Inner>, abort: Arc<AbortHandle>) -> compio::runtime::Task<()> {
    compio::runtime::spawn(async move {
        loop {
            compio::time::sleep(inner.options.ping_interval).await;
            let outstanding = inner.ctx.outstanding_pings.fetch_add(1, Ordering::SeqCst) + 1;
            if outstanding > inner.options.max_pings_out {
                warn!(outstanding, max = inner.options.max_pings_out, "max pings out exceeded");
                abort.abort();
                return;
            }
            let slot = rent_command(&inner.pool, Command::Ping, None);
            if inner.queue_tx.send(slot).is_err() {
                return;
            }
        }
    })
}

fn queue_rx(inner: &Arc<Inner>) -> nats_proto::command::CommandQueueReceiver {
    inner.queue_rx.clone()
}

/// Process-unique component appended to the configured inbox prefix so two
/// connections in the same process never collide (§3 "Inbox prefix").
fn inbox_nonce() -> String {
    use rand::Rng;
    let n: u64 = rand::thread_rng().gen();
    format!("{n:x}")
}
