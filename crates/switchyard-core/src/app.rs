//! Application hooks.

use crate::package::{Package, Reply, SessionId};

/// Protocol logic plugged into the server.
///
/// `open_session` runs on the event-loop thread; `on_message` runs on worker
/// threads, possibly concurrently for the same session.
pub trait Application: Send + Sync + 'static {
    /// Decoded message type, shared with the codec.
    type Message: Send + 'static;

    /// Per-session state, created once the session becomes active.
    type Context: Send + 'static;

    /// Create the context for a session that just became active.
    ///
    /// Called exactly once per session, whether or not it went through a
    /// handshake.
    fn open_session(&self, session: SessionId) -> Self::Context;

    /// Handle one received message.
    fn on_message(&self, package: &Package<Self::Message, Self::Context>) -> Reply<Self::Message>;
}
