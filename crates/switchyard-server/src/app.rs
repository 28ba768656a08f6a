//! Demo application served by the binary.
//!
//! Messages are CBOR-encoded [`DemoMessage`] values. Each session context
//! counts the messages the session has sent so far.

use serde::{Deserialize, Serialize};
use switchyard_core::{Application, CborCodec, Package, Reply, SessionId};

/// Demo protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DemoMessage {
    /// Answered with `Pong` carrying the same value
    Ping(u64),
    /// Answer to `Ping`
    Pong(u64),
    /// Answered with itself
    Echo(String),
    /// Ask how many messages this session has sent, this one included
    Count,
    /// Answer to `Count`
    Counted(u64),
    /// Answered with `Goodbye`, then the session is closed
    Goodbye,
    /// Stop the server
    Shutdown,
}

/// Codec for [`DemoMessage`].
pub type DemoCodec = CborCodec<DemoMessage>;

/// Application answering [`DemoMessage`] requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoApp;

impl Application for DemoApp {
    type Message = DemoMessage;
    type Context = u64;

    fn open_session(&self, id: SessionId) -> u64 {
        tracing::debug!(%id, "demo session opened");
        0
    }

    fn on_message(&self, package: &Package<DemoMessage, u64>) -> Reply<DemoMessage> {
        let received = {
            let mut count = package.session().context();
            *count += 1;
            *count
        };

        match package.message() {
            DemoMessage::Ping(n) => Reply::respond(DemoMessage::Pong(*n)),
            DemoMessage::Echo(text) => Reply::respond(DemoMessage::Echo(text.clone())),
            DemoMessage::Count => Reply::respond(DemoMessage::Counted(received)),
            DemoMessage::Goodbye => {
                tracing::info!(session = %package.session().id(), received, "client said goodbye");
                Reply::respond(DemoMessage::Goodbye).and_close()
            },
            DemoMessage::Shutdown => {
                tracing::info!(session = %package.session().id(), "shutdown requested by client");
                Reply::none().and_stop()
            },
            DemoMessage::Pong(_) | DemoMessage::Counted(_) => {
                let session = package.session().id();
                tracing::debug!(%session, "ignoring response-only message");
                Reply::none()
            },
        }
    }
}
