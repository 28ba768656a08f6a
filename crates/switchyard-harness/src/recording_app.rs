//! Application that records what the server hands it.

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use switchyard_core::{Application, Package, Reply, SessionId};

use crate::text_codec::TextMessage;

#[derive(Debug, Default)]
struct Recording {
    opened: Vec<SessionId>,
    handled: Vec<(SessionId, TextMessage)>,
}

/// [`Application`] for the text protocol that records every hook call.
///
/// `Ping` → `Pong`, `Echo` → `Echo`, `Quit` closes the session, `Stop` stops
/// the server. The per-session context counts handled messages.
#[derive(Debug, Clone, Default)]
pub struct RecordingApp {
    inner: Arc<(Mutex<Recording>, Condvar)>,
}

impl RecordingApp {
    /// Create an empty recording.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions passed to `open_session`, in call order.
    pub fn opened(&self) -> Vec<SessionId> {
        self.inner.0.lock().opened.clone()
    }

    /// Messages passed to `on_message`, in completion order.
    pub fn handled(&self) -> Vec<(SessionId, TextMessage)> {
        self.inner.0.lock().handled.clone()
    }

    /// Block until at least `count` messages were handled or `timeout`
    /// elapsed. Returns whether the count was reached.
    pub fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        let (lock, handled) = &*self.inner;
        let mut recording = lock.lock();
        while recording.handled.len() < count {
            if handled.wait_for(&mut recording, timeout).timed_out() {
                return recording.handled.len() >= count;
            }
        }
        true
    }
}

impl Application for RecordingApp {
    type Message = TextMessage;
    type Context = u64;

    fn open_session(&self, session: SessionId) -> u64 {
        self.inner.0.lock().opened.push(session);
        0
    }

    fn on_message(&self, package: &Package<TextMessage, u64>) -> Reply<TextMessage> {
        let session = package.session().id();
        *package.session().context() += 1;

        {
            let (lock, handled) = &*self.inner;
            lock.lock().handled.push((session, package.message().clone()));
            handled.notify_all();
        }

        match package.message() {
            TextMessage::Ping(payload) => Reply::respond(TextMessage::Pong(payload.clone())),
            TextMessage::Echo(payload) => Reply::respond(TextMessage::Echo(payload.clone())),
            TextMessage::Pong(_) => Reply::none(),
            TextMessage::Quit => Reply::close(),
            TextMessage::Stop => Reply::none().and_stop(),
        }
    }
}
