//! Switchyard core.
//!
//! Transport and session core of a protocol server: one event-loop thread
//! multiplexes listening and connected channels over a readiness poller,
//! frames discrete messages out of byte streams, and hands each decoded
//! message to a pool of worker threads running application logic.
//!
//! # Architecture
//!
//! This crate performs no OS I/O itself. The poller, the listeners and
//! transports, and the message codec are collaborator traits. Production
//! implementations live in `switchyard-server`; deterministic simulated ones
//! live in `switchyard-harness`.
//!
//! # Components
//!
//! - [`ChannelMultiplexer`]: readiness polling, interest masks, idle budgets
//! - [`Server`]: per-session state machine, framing loop, response path
//! - [`WorkerPool`]: FIFO work queue drained by a fixed set of threads
//! - [`Package`]: one decoded message crossing into the worker pool
//!
//! # Threading
//!
//! Session state is owned by the event loop. Workers only see a [`Package`]:
//! the message, a [`SessionHandle`] guarding the session's application
//! context, and a [`ServerControl`] through which they post responses, close
//! requests and stop requests back to the loop.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod codec;
pub mod config;
pub mod error;
pub mod framing;
pub mod multiplexer;
pub mod package;
pub mod poller;
pub mod pool;
pub mod readiness;
pub mod server;
mod session;
pub mod transport;

pub use app::Application;
pub use codec::{CborCodec, Codec};
pub use config::ServerConfig;
pub use error::{CodecError, FrameError, MultiplexerError, PoolError, ServerError, SubmitError};
pub use multiplexer::{ChannelId, ChannelMultiplexer, DEFAULT_MAX_EVENTS, Ready, Wakeup};
pub use package::{Package, Reply, ServerControl, SessionHandle, SessionId};
pub use poller::{Notify, PollEvent, Poller};
pub use pool::WorkerPool;
pub use readiness::Readiness;
pub use server::{Flow, Server};
pub use session::Phase;
pub use transport::{Accepted, Handshake, Listener, Received, Sent, Transport};
