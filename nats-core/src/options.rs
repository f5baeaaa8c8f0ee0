//! Connection configuration options.
//!
//! Builder-style (`with_*`, consuming `self`) configuration surface, the same
//! shape libzmq-flavored socket options take in this codebase's lineage, now
//! covering the knobs a NATS client core actually needs: candidate URLs,
//! keepalive tuning, reconnect backoff, pooling, inbox naming and TLS mode.

use std::time::Duration;

/// TLS negotiation policy for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Upgrade to TLS only if the server's INFO advertises `tls_required`.
    #[default]
    Auto,
    /// Prefer TLS when available but tolerate a plaintext server.
    Prefer,
    /// Fail the connection if the server does not support TLS.
    Require,
    /// TLS from the first byte, no STARTTLS-style upgrade (e.g. wss-style
    /// endpoints behind a TLS-terminating load balancer).
    Implicit,
    /// Never attempt TLS even if the server requests it.
    Disable,
}

/// TLS material and validation knobs, consulted only when `TlsMode` is not
/// `Disable`. Certificate/key loading itself is an external collaborator
/// (§1 out of scope) — this struct carries opaque byte material through to
/// whatever TLS connector the socket factory wires up.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_certificates: Option<bytes::Bytes>,
    pub client_certificate: Option<bytes::Bytes>,
    pub client_key: Option<bytes::Bytes>,
    pub check_revocation: bool,
    /// Test-only escape hatch. Never set this outside test harnesses.
    pub insecure_skip_verify: bool,
}

/// Credentials/identity supplied in `CONNECT`. Token/user-pass/nkey/jwt
/// resolution is an external collaborator (§1); this struct only carries
/// whatever the caller supplied through to the wire.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub auth_token: Option<String>,
    pub nkey: Option<String>,
    pub jwt: Option<String>,
    pub signature: Option<String>,
}

/// Connection configuration options.
///
/// # Examples
///
/// ```
/// use nats_core::options::ConnectOptions;
/// use std::time::Duration;
///
/// let opts = ConnectOptions::default()
///     .with_seed_urls(vec!["nats://127.0.0.1:4222".into()])
///     .with_ping_interval(Duration::from_secs(30))
///     .with_max_pings_out(2);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Endpoints to try at connect, in order, before any server-advertised
    /// URLs are known.
    pub seed_urls: Vec<String>,

    /// Per-endpoint TCP/TLS connect timeout.
    pub connect_timeout: Duration,

    /// Interval between keepalive PINGs while the connection is Open.
    pub ping_interval: Duration,

    /// Outstanding unanswered PINGs tolerated before the socket is aborted.
    pub max_pings_out: u32,

    /// Base delay between reconnect rounds (one round = one pass over every
    /// candidate URL).
    pub reconnect_wait: Duration,

    /// Upper bound of the uniform jitter added to `reconnect_wait`.
    pub reconnect_jitter: Duration,

    /// Disable shuffling of the reconnect candidate list.
    pub no_randomize: bool,

    /// Max pooled command instances retained per command kind.
    pub command_pool_size: usize,

    /// Root of this connection's private reply-subject namespace. A random
    /// component is appended at connect time to make it process-unique.
    pub inbox_prefix: String,

    /// TLS negotiation policy.
    pub tls_mode: TlsMode,

    /// TLS material, consulted when `tls_mode != Disable`.
    pub tls_options: TlsOptions,

    /// Size of arena-allocated buffers for reading from the network.
    pub read_buffer_size: usize,

    /// High-water mark (in bytes) at which the writer flushes even though the
    /// command queue is not yet empty.
    pub write_high_water_mark: usize,

    /// Identity sent in `CONNECT`. Empty by default (anonymous connect).
    pub credentials: Credentials,

    /// Whether the server should echo this connection's own publishes back
    /// to it when it is also a matching subscriber.
    pub echo: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            seed_urls: vec!["nats://127.0.0.1:4222".to_string()],
            connect_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            reconnect_wait: Duration::from_millis(500),
            reconnect_jitter: Duration::from_millis(100),
            no_randomize: false,
            command_pool_size: 256,
            inbox_prefix: "_INBOX.".to_string(),
            tls_mode: TlsMode::Auto,
            tls_options: TlsOptions::default(),
            read_buffer_size: 8192,
            write_high_water_mark: 32 * 1024,
            credentials: Credentials::default(),
            echo: true,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_seed_urls(mut self, urls: Vec<String>) -> Self {
        self.seed_urls = urls;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    #[must_use]
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    #[must_use]
    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_no_randomize(mut self, disable_shuffle: bool) -> Self {
        self.no_randomize = disable_shuffle;
        self
    }

    #[must_use]
    pub fn with_command_pool_size(mut self, size: usize) -> Self {
        self.command_pool_size = size;
        self
    }

    #[must_use]
    pub fn with_inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    #[must_use]
    pub fn with_tls_options(mut self, options: TlsOptions) -> Self {
        self.tls_options = options;
        self
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_write_high_water_mark(mut self, bytes: usize) -> Self {
        self.write_high_water_mark = bytes;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = ConnectOptions::default();
        assert_eq!(opts.max_pings_out, 2);
        assert_eq!(opts.ping_interval, Duration::from_secs(120));
        assert!(!opts.no_randomize);
        assert_eq!(opts.inbox_prefix, "_INBOX.");
    }

    #[test]
    fn builder_pattern() {
        let opts = ConnectOptions::new()
            .with_seed_urls(vec!["nats://a:4222".into(), "nats://b:4222".into()])
            .with_max_pings_out(5)
            .with_no_randomize(true);

        assert_eq!(opts.seed_urls.len(), 2);
        assert_eq!(opts.max_pings_out, 5);
        assert!(opts.no_randomize);
    }
}
