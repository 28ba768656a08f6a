//! Units of work crossing the event-loop / worker boundary.
//!
//! A [`Package`] is built on the event-loop thread from one decoded message
//! and moved into the worker pool. Workers never touch session state: they
//! read the message, lock the session's context through its
//! [`SessionHandle`], and post responses or control requests back through
//! [`ServerControl`]. The event loop is woken through the poller's notifier
//! and applies the posted commands itself.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::poller::Notify;

/// Identifier of one session, unique for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Shared reference to a session's application context.
///
/// Stays valid after the session closes; the context is released when the
/// last handle is dropped.
pub struct SessionHandle<C> {
    id: SessionId,
    context: Arc<Mutex<C>>,
}

impl<C> SessionHandle<C> {
    /// Wrap a freshly created context.
    pub fn new(id: SessionId, context: C) -> Self {
        Self { id, context: Arc::new(Mutex::new(context)) }
    }

    /// Session this handle belongs to.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Lock the context. Do not hold the guard across blocking work.
    pub fn context(&self) -> MutexGuard<'_, C> {
        self.context.lock()
    }

    /// Swap in a new context, returning the previous one.
    pub fn replace_context(&self, context: C) -> C {
        std::mem::replace(&mut *self.context.lock(), context)
    }
}

impl<C> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self { id: self.id, context: Arc::clone(&self.context) }
    }
}

impl<C> fmt::Debug for SessionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Request posted from a worker to the event loop.
#[derive(Debug)]
pub(crate) enum Command<M> {
    /// Queue a response on a session
    Send { session: SessionId, message: M },
    /// Close a session once its queued responses are flushed
    Close { session: SessionId },
}

struct ControlInner<M> {
    mailbox: Mutex<Vec<Command<M>>>,
    stop: AtomicBool,
    notify: Arc<dyn Notify>,
}

/// Thread-safe control surface of a running server.
///
/// Cheap to clone. Usable from worker threads, signal handlers, or tests.
pub struct ServerControl<M> {
    inner: Arc<ControlInner<M>>,
}

impl<M> ServerControl<M> {
    pub(crate) fn new(notify: Arc<dyn Notify>) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                mailbox: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                notify,
            }),
        }
    }

    /// Queue `message` for delivery to `session`.
    ///
    /// Silently dropped by the event loop if the session has closed.
    pub fn send(&self, session: SessionId, message: M) {
        self.post(Command::Send { session, message });
    }

    /// Close `session` after its queued responses have been written.
    pub fn close(&self, session: SessionId) {
        self.post(Command::Close { session });
    }

    /// Ask the event loop to stop. Observed once per loop iteration.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// True once [`ServerControl::stop`] has been called.
    pub fn is_stopping(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    pub(crate) fn drain(&self) -> Vec<Command<M>> {
        std::mem::take(&mut *self.inner.mailbox.lock())
    }

    fn post(&self, command: Command<M>) {
        self.inner.mailbox.lock().push(command);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.inner.notify.notify() {
            tracing::warn!("failed to wake event loop: {}", e);
        }
    }
}

impl<M> Clone for ServerControl<M> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<M> fmt::Debug for ServerControl<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerControl")
            .field("stopping", &self.is_stopping())
            .field("queued_commands", &self.inner.mailbox.lock().len())
            .finish()
    }
}

/// One message in flight through the worker pool.
pub struct Package<M, C> {
    message: M,
    raw: Bytes,
    session: SessionHandle<C>,
    server: ServerControl<M>,
}

impl<M, C> Package<M, C> {
    /// Bundle a decoded message with its origin.
    pub fn new(
        message: M,
        raw: Bytes,
        session: SessionHandle<C>,
        server: ServerControl<M>,
    ) -> Self {
        Self { message, raw, session, server }
    }

    /// Decoded request, or the response to be encoded.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Take the message out, dropping the rest.
    pub fn into_message(self) -> M {
        self.message
    }

    /// Frame body the message was decoded from. Empty for responses.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Originating session.
    pub fn session(&self) -> &SessionHandle<C> {
        &self.session
    }

    /// Server control surface.
    pub fn server(&self) -> &ServerControl<M> {
        &self.server
    }

    /// Build a response addressed to the same session.
    pub fn response(&self, message: M) -> Self {
        Self {
            message,
            raw: Bytes::new(),
            session: self.session.clone(),
            server: self.server.clone(),
        }
    }

    /// Queue this package's message on its session.
    pub fn send(self) {
        let Self { message, session, server, .. } = self;
        server.send(session.id(), message);
    }

    /// Close the originating session after pending responses are flushed.
    pub fn close_session(&self) {
        self.server.close(self.session.id());
    }

    /// Ask the server loop to stop.
    pub fn stop_server(&self) {
        self.server.stop();
    }
}

impl<M: fmt::Debug, C> fmt::Debug for Package<M, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("session", &self.session.id())
            .field("message", &self.message)
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

/// What an application handler wants done after processing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<M> {
    /// Response to queue on the originating session
    pub response: Option<M>,
    /// Close the session once the response has been flushed
    pub close: bool,
    /// Stop the server loop
    pub stop: bool,
}

impl<M> Reply<M> {
    /// Nothing to send, nothing to change.
    pub fn none() -> Self {
        Self { response: None, close: false, stop: false }
    }

    /// Send `message` back.
    pub fn respond(message: M) -> Self {
        Self { response: Some(message), close: false, stop: false }
    }

    /// Close the session without responding.
    pub fn close() -> Self {
        Self { response: None, close: true, stop: false }
    }

    /// Also close the session after the response is flushed.
    #[must_use]
    pub fn and_close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Also stop the server.
    #[must_use]
    pub fn and_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    /// Post this reply for `package`'s session.
    pub(crate) fn apply<C>(self, package: &Package<M, C>) {
        let session = package.session().id();
        let server = package.server();
        if let Some(response) = self.response {
            server.send(session, response);
        }
        if self.close {
            server.close(session);
        }
        if self.stop {
            server.stop();
        }
    }
}

impl<M> Default for Reply<M> {
    fn default() -> Self {
        Self::none()
    }
}
