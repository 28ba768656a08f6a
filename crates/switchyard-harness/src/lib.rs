//! Deterministic simulation harness for switchyard testing.
//!
//! In-memory implementations of the core's collaborator traits:
//!
//! - [`SimNet`]: shared simulated network; tests act as peers via [`SimClient`]
//! - [`SimPoller`]: level-triggered [`switchyard_core::Poller`] with virtual time
//! - [`SimListener`] / [`SimTransport`]: scripted handshakes, chunked delivery,
//!   peer back-pressure
//! - [`TextCodec`] / [`RecordingApp`]: a tiny text protocol and an application
//!   that records every hook call
//!
//! A poll without timeout that sees no change for [`STALL_AFTER`] fails
//! instead of blocking, so a missing wakeup shows up as a test failure.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod recording_app;
pub mod sim_driver;
pub mod sim_net;
pub mod sim_poller;
pub mod sim_transport;
pub mod text_codec;

pub use recording_app::RecordingApp;
pub use sim_driver::{SimServer, run_until, sim_config, sim_server};
pub use sim_net::{ConnectionScript, HandshakeStep, SimClient, SimDescriptor, SimNet};
pub use sim_poller::{STALL_AFTER, SimPoller};
pub use sim_transport::{SimListener, SimTransport};
pub use text_codec::{TextCodec, TextMessage};
