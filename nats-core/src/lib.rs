//! Runtime-agnostic building blocks shared by the NATS protocol engine and
//! the public client crate:
//! - Pinned / io_uring-safe allocation (`alloc`)
//! - Segmented receive buffering (`buffer`)
//! - Server URL addressing (`endpoint`)
//! - Error taxonomy (`error`)
//! - Connection configuration (`options`)
//! - Reconnect candidate bookkeeping (`reconnect`)
//! - Generation-counted command pooling (`pool`)
//! - Replaceable single-shot completions (`signal`)
//! - Non-cancelable-section poisoning (`poison`)
//! - TCP tuning (`tcp`)
//! - Stream transport: connect, TLS upgrade, split, abort (`socket`, `tls`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]
pub mod alloc;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod pool;
pub mod poison;
pub mod reconnect;
pub mod signal;
pub mod socket;
pub mod tcp;
pub mod tls;

/// Small prelude to make downstream crates ergonomic. Kept minimal to avoid
/// API lock-in.
pub mod prelude {
    pub use crate::alloc::{IoArena, SlabMut};
    pub use crate::buffer::SegmentedBuffer;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{NatsError, Result};
    pub use crate::options::{ConnectOptions, Credentials, TlsMode, TlsOptions};
    pub use crate::pool::Pool;
    pub use crate::reconnect::{jittered_delay, ReconnectCandidates, ReconnectError};
    pub use crate::signal::Signal;
    pub use crate::socket::{AbortHandle, ReadHalf, WriteHalf};
}
