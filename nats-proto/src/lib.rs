//! NATS wire protocol engine: the streaming decoder, the outbound `Command`
//! set, the pipelining writer and reader loops, the handshake sequencer, and
//! the subscription/request registries they dispatch into (§4 of the
//! connection-core design).
//!
//! **Internal crate.** Application code should depend on `natsclient`, which
//! composes these pieces into the `Connection` state machine.

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::unused_async)]
#![allow(clippy::let_underscore_future)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::uninlined_format_args)] // Style preference
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives
#![allow(clippy::while_let_loop)] // Sometimes clearer as explicit loop
#![allow(clippy::option_if_let_else)] // Sometimes clearer as if/else
#![allow(clippy::never_loop)] // State machines use loop with early returns

pub mod codec;
pub mod command;
pub mod handshake;
pub mod ping;
pub mod reader;
pub mod request;
pub mod serverinfo;
pub mod subscription;
pub mod writer;

/// Convenient re-export of the types a caller composing a `Connection` needs
/// most often.
pub mod prelude {
    pub use crate::codec::{NatsDecoder, ServerOp};
    pub use crate::command::{
        new_command_pool, rent_command, Command, CommandPool, CommandQueueReceiver,
        CommandQueueSender, PublishEntry, SubscribeEntry,
    };
    pub use crate::handshake::{self, Established};
    pub use crate::ping::PingRegistry;
    pub use crate::reader::{HandshakeOutcome, ReaderContext};
    pub use crate::request::{RequestFuture, RequestRegistry};
    pub use crate::serverinfo::{ConnectArgs, ServerInfo};
    pub use crate::subscription::{
        Handler, InboundMessage, RequestHandler, SubscriptionHandle, SubscriptionRegistry,
    };
    pub use crate::writer::{run_writer_loop, WriterConfig};
}
