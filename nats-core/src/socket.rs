//! Stream transport: plain TCP or TLS, connect, split, abort.
//!
//! The writer loop and reader loop run as two independently spawned tasks
//! (§4.1/§4.2/§4.3), each wanting to own its half of the socket outright
//! rather than share a `&mut` across an await point. Plain TCP gets this for
//! free by duplicating the file descriptor, same trick `tcp::enable_tcp_nodelay`
//! already uses to reach the raw socket without taking ownership away from
//! compio. TLS additionally needs the two halves to agree on one
//! `rustls::ClientConnection`, handled in `tls.rs`.

#![allow(unsafe_code)]

use std::io;
use std::time::Duration;

use compio::net::TcpStream;

use crate::endpoint::Endpoint;
use crate::error::NatsError;
use crate::options::{TlsMode, TlsOptions};
use crate::tcp::enable_tcp_nodelay;
use crate::tls::{TlsReadHalf, TlsStream, TlsWriteHalf};

/// Either half of a split connection stream.
pub enum ReadHalf {
    Plain(TcpStream),
    Tls(TlsReadHalf),
}

pub enum WriteHalf {
    Plain(TcpStream),
    Tls(TlsWriteHalf),
}

impl compio::io::AsyncRead for ReadHalf {
    async fn read<B: compio::buf::IoBufMut>(&mut self, buf: B) -> compio::buf::BufResult<usize, B> {
        match self {
            Self::Plain(s) => compio::io::AsyncRead::read(s, buf).await,
            Self::Tls(s) => compio::io::AsyncRead::read(s, buf).await,
        }
    }
}

impl compio::io::AsyncWrite for WriteHalf {
    async fn write<B: compio::buf::IoBuf>(&mut self, buf: B) -> compio::buf::BufResult<usize, B> {
        match self {
            Self::Plain(s) => compio::io::AsyncWrite::write(s, buf).await,
            Self::Tls(s) => compio::io::AsyncWrite::write(s, buf).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => compio::io::AsyncWrite::flush(s).await,
            Self::Tls(s) => compio::io::AsyncWrite::flush(s).await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => compio::io::AsyncWrite::shutdown(s).await,
            Self::Tls(s) => compio::io::AsyncWrite::shutdown(s).await,
        }
    }
}

/// Opens a TCP connection to `endpoint` with a connect timeout and
/// `TCP_NODELAY` set. Does not attempt TLS: the caller decides that once it
/// has seen (or deliberately skipped) the server's INFO line, since
/// `TlsMode::Auto`/`Prefer`/`Require` can only be resolved against
/// `ServerInfo::tls_required`.
pub async fn connect_tcp(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, NatsError> {
    let fut = TcpStream::connect(endpoint.authority());
    let stream = compio::time::timeout(connect_timeout, fut)
        .await
        .map_err(|_| NatsError::Connect(format!("connect to {endpoint} timed out")))?
        .map_err(|e| NatsError::Connect(format!("connect to {endpoint} failed: {e}")))?;
    enable_tcp_nodelay(&stream).map_err(NatsError::Io)?;
    Ok(stream)
}

/// `Implicit` mode wraps TLS before anything else is read off the wire —
/// unlike `Auto`/`Prefer`/`Require`, which need the plaintext INFO line
/// first to learn `tls_required`.
#[must_use]
pub fn is_implicit_tls(mode: TlsMode, endpoint: &Endpoint) -> bool {
    mode == TlsMode::Implicit || (endpoint.explicit_tls && mode != TlsMode::Disable)
}

/// Upgrades an already-connected plaintext socket to TLS, given the
/// plaintext bytes already consumed while peeking the INFO line (may be
/// empty for `Implicit` mode, where nothing was read yet).
pub async fn upgrade_tls(
    tcp: TcpStream,
    endpoint: &Endpoint,
    options: &TlsOptions,
    prefill: &[u8],
) -> Result<TlsStream, NatsError> {
    TlsStream::handshake(tcp, &endpoint.host, options, prefill).await
}

/// Decides, given the server's advertised `tls_required`, whether a
/// non-implicit connection must still upgrade.
#[must_use]
pub fn should_upgrade(mode: TlsMode, tls_required: bool) -> Result<bool, NatsError> {
    match mode {
        TlsMode::Disable => Ok(false),
        TlsMode::Auto | TlsMode::Prefer => Ok(tls_required),
        TlsMode::Require => {
            if tls_required {
                Ok(true)
            } else {
                Err(NatsError::Handshake(
                    "tls required by client but server did not advertise tls_required".to_string(),
                ))
            }
        }
        TlsMode::Implicit => Ok(true),
    }
}

/// Splits a plain TCP stream into independently owned halves backed by
/// duplicated file descriptors; each can be driven from its own task
/// without the other blocking on it.
pub fn split_plain(stream: TcpStream) -> Result<(ReadHalf, WriteHalf), NatsError> {
    let write_half = dup_tcp_stream(&stream)?;
    Ok((ReadHalf::Plain(stream), WriteHalf::Plain(write_half)))
}

pub fn split_tls(stream: TlsStream) -> Result<(ReadHalf, WriteHalf), NatsError> {
    let (r, w) = stream.split()?;
    Ok((ReadHalf::Tls(r), WriteHalf::Tls(w)))
}

fn dup_tcp_stream(stream: &TcpStream) -> Result<TcpStream, NatsError> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let dup = sock.try_clone();
        std::mem::forget(sock);
        let dup = dup.map_err(NatsError::Io)?;
        Ok(unsafe { TcpStream::from_raw_fd(dup.into_raw_fd()) })
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket, IntoRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let dup = sock.try_clone();
        std::mem::forget(sock);
        let dup = dup.map_err(NatsError::Io)?;
        Ok(unsafe { TcpStream::from_raw_socket(dup.into_raw_socket()) })
    }
}

/// A handle that can force-close the underlying socket from outside the
/// reader/writer tasks — the ping watchdog's lever when `max_pings_out` is
/// exceeded, and `dispose()`'s lever for a clean teardown.
pub struct AbortHandle {
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
    #[cfg(windows)]
    sock: std::os::windows::io::RawSocket,
}

impl AbortHandle {
    #[must_use]
    pub fn new(stream: &TcpStream) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            Self {
                fd: stream.as_raw_fd(),
            }
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawSocket;
            Self {
                sock: stream.as_raw_socket(),
            }
        }
    }

    /// Shuts down both directions of the socket. Any task blocked in a read
    /// or write observes an I/O error and the reader/writer loops exit,
    /// which is what drives the connection into `Reconnecting`.
    pub fn abort(&self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::FromRawFd;
            let sock = unsafe { socket2::Socket::from_raw_fd(self.fd) };
            let _ = sock.shutdown(std::net::Shutdown::Both);
            std::mem::forget(sock);
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::FromRawSocket;
            let sock = unsafe { socket2::Socket::from_raw_socket(self.sock) };
            let _ = sock.shutdown(std::net::Shutdown::Both);
            std::mem::forget(sock);
        }
    }
}

// SAFETY: `AbortHandle` only ever duplicates-and-forgets the raw descriptor
// to issue a `shutdown(2)`, which is safe to call concurrently with other
// operations on the same socket from another thread.
unsafe impl Send for AbortHandle {}
unsafe impl Sync for AbortHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_mode_forces_tls_regardless_of_url_scheme() {
        let endpoint = Endpoint::parse("nats://host:4222").unwrap();
        assert!(is_implicit_tls(TlsMode::Implicit, &endpoint));
    }

    #[test]
    fn tls_scheme_url_forces_tls_even_under_auto_mode() {
        let endpoint = Endpoint::parse("tls://host:4222").unwrap();
        assert!(is_implicit_tls(TlsMode::Auto, &endpoint));
    }

    #[test]
    fn disable_mode_never_upgrades() {
        let endpoint = Endpoint::parse("tls://host:4222").unwrap();
        assert!(!is_implicit_tls(TlsMode::Disable, &endpoint));
    }

    #[test]
    fn require_mode_errors_without_server_support() {
        assert!(should_upgrade(TlsMode::Require, false).is_err());
        assert!(should_upgrade(TlsMode::Require, true).unwrap());
    }

    #[test]
    fn auto_mode_follows_server_advertisement() {
        assert!(!should_upgrade(TlsMode::Auto, false).unwrap());
        assert!(should_upgrade(TlsMode::Auto, true).unwrap());
    }

    #[test]
    fn disable_mode_ignores_server_advertisement() {
        assert!(!should_upgrade(TlsMode::Disable, true).unwrap());
    }
}
