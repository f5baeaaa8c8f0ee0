//! # natsclient
//!
//! A high-performance NATS client built on `io_uring` (via `compio`).
//!
//! ## Architecture
//!
//! The client is layered the way the codebase's earlier messaging-kernel
//! lineage laid out its protocol clients:
//!
//! - **`nats-core`**: runtime-agnostic building blocks — allocation,
//!   buffering, addressing, error taxonomy, options, reconnect bookkeeping,
//!   pooling, completion signals, the socket/TLS transport.
//! - **`nats-proto`**: the NATS wire protocol engine — a sans-IO decoder, the
//!   outbound command set, the pipelining writer/reader loops, the handshake
//!   sequencer, and the subscription/request registries.
//! - **`natsclient`**: this crate. Composes the above into [`Connection`], the
//!   single public entry point.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use natsclient::{Connection, ConnectOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::new(
//!     ConnectOptions::new().with_seed_urls(vec!["nats://127.0.0.1:4222".into()]),
//! );
//! conn.connect().await?;
//!
//! let _sub = conn.subscribe("greetings", None, std::sync::Arc::new(|msg| {
//!     println!("got {} bytes on {:?}", msg.payload.len(), msg.subject);
//! }));
//!
//! conn.publish("greetings", "hello".into())?;
//! conn.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - **Reconnect is transparent**: subscriptions and in-flight requests
//!   survive a socket replacement underneath the same [`Connection`] handle.
//! - **Zero-copy**: `bytes::Bytes` for refcounted message buffers.
//! - **`io_uring`**: native Linux async I/O via `compio`.
//! - **Sans-IO protocol core**: the decoder and command set in `nats-proto`
//!   are pure and independently testable.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives

mod connection;

pub use bytes::Bytes;
pub use connection::Connection;

pub use nats_core::endpoint::Endpoint;
pub use nats_core::error::NatsError;
pub use nats_core::options::{ConnectOptions, Credentials, TlsMode, TlsOptions};

pub use nats_proto::command::PublishEntry;
pub use nats_proto::request::RequestFuture;
pub use nats_proto::serverinfo::ServerInfo;
pub use nats_proto::subscription::{Handler, InboundMessage, RequestHandler, SubscriptionHandle};

/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
pub mod dev_tracing;
