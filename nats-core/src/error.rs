//! Error taxonomy for the NATS connection core.
//!
//! Every error kind named in the connection lifecycle (§7) has a variant here.
//! Handler-callback errors are deliberately NOT representable: those are caught
//! and logged at the call site and never become a `NatsError`.

use std::io;
use thiserror::Error;

/// Main error type for connection-core operations.
#[derive(Error, Debug)]
pub enum NatsError {
    /// IO error talking to the socket.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// All candidate URLs failed during connect() or a reconnect round.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Socket opened but the INFO/CONNECT/PONG exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed frame from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server returned `-ERR` with an authorization-flavored message; fatal for
    /// this socket.
    #[error("authorization error: {0}")]
    Auth(String),

    /// A flush to the socket failed; every command batched into it is failed
    /// with this error.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Raised on pending requests and in-flight commands when the connection
    /// transitions Open → Reconnecting.
    #[error("connection lost")]
    ConnectionLost,

    /// Raised on any operation against a disposed connection.
    #[error("connection disposed")]
    Disposed,

    /// Server sent a non-fatal `-ERR`.
    #[error("server error: {0}")]
    ServerError(String),
}

/// Result type alias for connection-core operations.
pub type Result<T> = std::result::Result<T, NatsError>;

impl NatsError {
    #[must_use]
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    #[must_use]
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Classify a `-ERR` message from the server. Authorization failures are
    /// fatal for the socket; everything else is logged and surfaced as
    /// `ServerError`.
    #[must_use]
    pub fn from_server_err(msg: &str) -> Self {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("authorization") || lower.contains("auth") {
            Self::Auth(msg.to_string())
        } else {
            Self::ServerError(msg.to_string())
        }
    }

    /// Whether this error should drive the state machine into `Reconnecting`
    /// rather than simply being surfaced to one caller.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::Auth(_) | Self::WriteFailed(_)
        )
    }
}
