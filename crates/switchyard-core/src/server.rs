//! Server loop.
//!
//! Drives every session from a single thread. Each call to
//! [`Server::run_once`] takes exactly one wakeup from the multiplexer and
//! applies the matching state transition:
//!
//! - listener readable: accept until the listener reports `Pending`
//! - handshaking: retry the transport handshake
//! - active readable: frame messages until the transport runs dry, decode
//!   them, and submit one [`Package`] per message to the worker pool
//! - active writable: flush queued responses
//! - idle timeout: tear the session down
//! - notified: apply commands workers posted through [`ServerControl`]
//!
//! Per-session failures tear that session down and never abort the loop. Only
//! a failing poll call is returned to the caller.

use std::{collections::HashMap, fmt, io, sync::Arc};

use bytes::Bytes;

use crate::{
    app::Application,
    codec::Codec,
    config::ServerConfig,
    error::{MultiplexerError, ServerError},
    multiplexer::{ChannelId, ChannelMultiplexer, Ready, Wakeup},
    package::{Command, Package, ServerControl, SessionHandle, SessionId},
    poller::Poller,
    pool::WorkerPool,
    readiness::Readiness,
    session::{ActiveSession, HandshakingSession, ListenerSession, Phase, Session},
    transport::{Accepted, Handshake, Listener, Received, Sent, Transport},
};

/// Outcome of one [`Server::run_once`] iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep calling `run_once`.
    Continue,

    /// A stop was requested; the loop should exit.
    Stopped,
}

type Item<A> = Package<<A as Application>::Message, <A as Application>::Context>;

/// Readiness-driven protocol server.
///
/// Generic over the poller, listener/transport, codec and application so the
/// same state machine runs against real sockets and the simulation harness.
pub struct Server<P, L, Cd, A>
where
    P: Poller,
    L: Listener<Descriptor = P::Descriptor>,
    Cd: Codec<Message = A::Message>,
    A: Application,
{
    mux: ChannelMultiplexer<P, SessionId>,
    sessions: HashMap<SessionId, Session<L, A::Message, A::Context>>,
    next_session: u64,
    /// Handshaking and active sessions
    connections: usize,
    codec: Cd,
    app: Arc<A>,
    pool: WorkerPool<Item<A>>,
    control: ServerControl<A::Message>,
    config: ServerConfig,
}

impl<P, L, Cd, A> Server<P, L, Cd, A>
where
    P: Poller,
    L: Listener<Descriptor = P::Descriptor>,
    Cd: Codec<Message = A::Message>,
    A: Application,
{
    /// Bind every configured address, start the worker pool, and register
    /// the listeners.
    ///
    /// `bind` creates one listener per address. If any address fails, the
    /// listeners created so far are unregistered and closed.
    pub fn new<B>(
        config: ServerConfig,
        poller: P,
        codec: Cd,
        app: A,
        bind: B,
    ) -> Result<Self, ServerError>
    where
        B: FnMut(&str) -> io::Result<L>,
    {
        if config.listen.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let mut mux = ChannelMultiplexer::new(poller, config.max_events);
        let control = ServerControl::new(mux.notifier().map_err(ServerError::Notifier)?);
        let app = Arc::new(app);

        let pool = {
            let app = Arc::clone(&app);
            WorkerPool::new(
                config.workers,
                config.queue_capacity,
                move |package: Item<A>| {
                    let reply = app.on_message(&package);
                    reply.apply(&package);
                },
                |package: Item<A>| {
                    let session = package.session().id();
                    tracing::debug!(%session, "discarding unprocessed message");
                },
            )?
        };

        let mut server = Self {
            mux,
            sessions: HashMap::new(),
            next_session: 0,
            connections: 0,
            codec,
            app,
            pool,
            control,
            config,
        };
        server.bind_listeners(bind)?;

        tracing::info!(
            listeners = server.config.listen.len(),
            workers = server.config.workers,
            "server ready"
        );
        Ok(server)
    }

    /// Serve until a stop is requested or polling fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            match self.run_once()? {
                Flow::Continue => {},
                Flow::Stopped => break,
            }
        }
        tracing::info!(sessions = self.connections, "server loop stopped");
        Ok(())
    }

    /// Wait for one wakeup and handle it.
    ///
    /// # Errors
    ///
    /// `ServerError::Multiplexer` if the poll call failed. The server cannot
    /// continue after that.
    pub fn run_once(&mut self) -> Result<Flow, ServerError> {
        if self.control.is_stopping() {
            return Ok(Flow::Stopped);
        }

        match self.mux.wait()? {
            Wakeup::Channel(ready) => self.handle_ready(ready),
            Wakeup::Notified => self.apply_commands(),
        }

        if self.control.is_stopping() {
            tracing::info!("stop requested");
            return Ok(Flow::Stopped);
        }
        Ok(Flow::Continue)
    }

    /// Control surface for requesting sends, closes or a stop.
    pub fn control(&self) -> ServerControl<A::Message> {
        self.control.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Every session with its phase, listeners included, in creation order.
    pub fn sessions(&self) -> Vec<(SessionId, Phase)> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|(id, s)| (*id, s.phase())).collect();
        sessions.sort_unstable_by_key(|(id, _)| *id);
        sessions
    }

    /// Phase of one session, `None` once it has closed.
    pub fn phase(&self, id: SessionId) -> Option<Phase> {
        self.sessions.get(&id).map(Session::phase)
    }

    /// Number of handshaking and active sessions.
    pub fn session_count(&self) -> usize {
        self.connections
    }

    /// Interest mask currently registered for a session's channel.
    pub fn interest(&self, id: SessionId) -> Option<Readiness> {
        self.sessions.get(&id).and_then(|session| self.mux.interest(session.channel()))
    }

    /// Responses queued on a session and not yet handed to its transport.
    pub fn outgoing_len(&self, id: SessionId) -> Option<usize> {
        match self.sessions.get(&id)? {
            Session::Active(active) => {
                Some(active.outgoing.len() + usize::from(active.pending_frame.is_some()))
            },
            _ => None,
        }
    }

    /// Addresses the listeners are actually bound to.
    pub fn listener_addresses(&self) -> Vec<String> {
        let mut listeners: Vec<_> = self
            .sessions
            .iter()
            .filter_map(|(id, session)| match session {
                Session::Listener(listener) => Some((*id, listener.address.clone())),
                _ => None,
            })
            .collect();
        listeners.sort_unstable_by_key(|(id, _)| *id);
        listeners.into_iter().map(|(_, address)| address).collect()
    }

    /// Messages waiting for a worker.
    pub fn queued_work(&self) -> usize {
        self.pool.queued()
    }

    /// Channel multiplexer, for inspection.
    pub fn multiplexer(&self) -> &ChannelMultiplexer<P, SessionId> {
        &self.mux
    }

    fn next_id(&mut self) -> SessionId {
        let id = SessionId::new(self.next_session);
        self.next_session += 1;
        id
    }

    fn bind_listeners<B>(&mut self, mut bind: B) -> Result<(), ServerError>
    where
        B: FnMut(&str) -> io::Result<L>,
    {
        for address in self.config.listen.clone() {
            let mut listener = bind(&address)
                .map_err(|source| ServerError::Bind { address: address.clone(), source })?;

            let id = self.next_id();
            let channel = match self.mux.register(listener.descriptor(), Readiness::LISTEN, id) {
                Ok(channel) => channel,
                Err(e) => {
                    listener.close();
                    return Err(e.into());
                },
            };

            let address = listener.local_address();
            tracing::info!(%id, %address, "listening");
            let session = ListenerSession { listener, channel, address };
            self.sessions.insert(id, Session::Listener(session));
        }
        Ok(())
    }

    fn handle_ready(&mut self, ready: Ready<SessionId>) {
        let id = ready.owner;
        let Some(session) = self.sessions.remove(&id) else {
            tracing::trace!(%id, "readiness for unknown session");
            return;
        };

        match session {
            Session::Listener(mut listener) => {
                self.accept_pending(&mut listener, ready.readiness);
                self.sessions.insert(id, Session::Listener(listener));
            },
            Session::Handshaking(handshaking) => {
                self.continue_handshake(id, handshaking, ready.readiness);
            },
            Session::Active(active) => self.service_active(id, active, ready.readiness),
        }
    }

    fn accept_pending(&mut self, listener: &mut ListenerSession<L>, readiness: Readiness) {
        if readiness.contains(Readiness::ERROR) {
            tracing::warn!(address = %listener.address, "listener reported an error condition");
        }

        loop {
            match listener.listener.accept() {
                Ok(Accepted::Connection(transport)) => self.admit(transport),
                Ok(Accepted::Pending) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(address = %listener.address, "accept failed: {}", e);
                    break;
                },
            }
        }
    }

    /// Register a freshly accepted connection, either straight into `Active`
    /// or into `Handshaking` if the transport still needs I/O.
    fn admit(&mut self, mut transport: L::Connection) {
        if self.connections >= self.config.max_sessions {
            tracing::warn!(
                limit = self.config.max_sessions,
                "session limit reached, refusing connection"
            );
            transport.close();
            return;
        }

        let id = self.next_id();
        let pending = transport.pending_io() & (Readiness::READ | Readiness::WRITE);
        let interest = if pending.is_empty() { Readiness::READ } else { pending };

        let channel = match self.mux.register(transport.descriptor(), interest, id) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(%id, "cannot watch accepted connection: {}", e);
                transport.close();
                return;
            },
        };
        self.connections += 1;

        if pending.is_empty() {
            tracing::info!(%id, "connection accepted");
            self.activate(id, transport, channel);
            return;
        }

        if let Err(e) = self.mux.set_idle_budget(channel, self.config.handshake_timeout) {
            tracing::warn!(%id, "cannot arm handshake timeout: {}", e);
        }
        tracing::info!(%id, ?pending, "connection accepted, handshaking");
        self.sessions.insert(id, Session::Handshaking(HandshakingSession { transport, channel }));
    }

    fn continue_handshake(
        &mut self,
        id: SessionId,
        mut handshaking: HandshakingSession<L::Connection>,
        readiness: Readiness,
    ) {
        if readiness.is_timeout() {
            self.teardown(id, Session::Handshaking(handshaking), "handshake timed out");
            return;
        }

        match handshaking.transport.continue_handshake() {
            Ok(Handshake::Done) => {
                tracing::debug!(%id, "handshake complete");
                let HandshakingSession { transport, channel } = handshaking;
                self.activate(id, transport, channel);
            },
            Ok(Handshake::Pending(mask)) => {
                let mut interest = mask & (Readiness::READ | Readiness::WRITE);
                if interest.is_empty() {
                    interest = Readiness::READ;
                }
                match self.mux.set_interest(handshaking.channel, interest) {
                    Ok(()) => {
                        self.sessions.insert(id, Session::Handshaking(handshaking));
                    },
                    Err(e) => {
                        tracing::warn!(%id, "{}", e);
                        let session = Session::Handshaking(handshaking);
                        self.teardown(id, session, "poller update failed");
                    },
                }
            },
            Err(e) => {
                tracing::warn!(%id, "handshake failed: {}", e);
                self.teardown(id, Session::Handshaking(handshaking), "handshake failed");
            },
        }
    }

    /// Enter `Active`: read-only interest, idle budget, and the application's
    /// session hook.
    fn activate(&mut self, id: SessionId, transport: L::Connection, channel: ChannelId) {
        if let Err(e) = self.arm(channel, Readiness::READ) {
            tracing::warn!(%id, "{}", e);
            self.teardown(
                id,
                Session::Handshaking(HandshakingSession { transport, channel }),
                "poller update failed",
            );
            return;
        }

        let handle = SessionHandle::new(id, self.app.open_session(id));
        let active = Box::new(ActiveSession::new(transport, channel, handle));
        tracing::info!(%id, "session active");

        // Bytes that arrived with the last handshake flight never trigger a
        // new readable edge.
        if active.transport.has_buffered(&active.input) {
            self.service_active(id, active, Readiness::READ);
        } else {
            self.sessions.insert(id, Session::Active(active));
        }
    }

    fn arm(&mut self, channel: ChannelId, interest: Readiness) -> Result<(), MultiplexerError> {
        self.mux.set_interest(channel, interest)?;
        self.mux.set_idle_budget(channel, self.config.idle_timeout)
    }

    fn service_active(
        &mut self,
        id: SessionId,
        mut active: Box<ActiveSession<L::Connection, A::Message, A::Context>>,
        readiness: Readiness,
    ) {
        if readiness.is_timeout() {
            self.teardown(id, Session::Active(active), "idle timeout");
            return;
        }
        if readiness == Readiness::ERROR {
            self.teardown(id, Session::Active(active), "transport error");
            return;
        }

        if readiness.intersects(Readiness::READ | Readiness::ERROR) && !active.closing {
            if let Err(reason) = self.read_messages(&mut active) {
                self.teardown(id, Session::Active(active), reason);
                return;
            }
        }

        if readiness.contains(Readiness::WRITE) {
            if let Err(e) = self.write_pending(&mut active) {
                tracing::debug!(%id, "send failed: {}", e);
                self.teardown(id, Session::Active(active), "send failed");
                return;
            }
        }

        self.settle(id, active);
    }

    /// Pull framed messages until the transport has no complete one left.
    fn read_messages(
        &self,
        active: &mut ActiveSession<L::Connection, A::Message, A::Context>,
    ) -> Result<(), &'static str> {
        loop {
            match active.transport.receive(&mut active.input) {
                Ok(Received::Complete(len)) => {
                    if len > active.input.len() {
                        tracing::error!(
                            session = %active.handle.id(),
                            len,
                            buffered = active.input.len(),
                            "transport reported a message beyond its buffer"
                        );
                        return Err("transport error");
                    }
                    let raw = active.input.split_to(len).freeze();
                    self.dispatch(active, raw);
                },
                Ok(Received::Incomplete) => return Ok(()),
                Ok(Received::Closed) => return Err("peer closed"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    tracing::debug!(session = %active.handle.id(), "receive failed: {}", e);
                    return Err("receive failed");
                },
            }
        }
    }

    /// Decode one message body and hand it to the worker pool.
    fn dispatch(&self, active: &ActiveSession<L::Connection, A::Message, A::Context>, raw: Bytes) {
        let session = active.handle.id();
        let message = match self.codec.decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%session, len = raw.len(), "dropping message: {}", e);
                return;
            },
        };

        tracing::trace!(%session, len = raw.len(), "message received");
        let package = Package::new(message, raw, active.handle.clone(), self.control.clone());
        if let Err(e) = self.pool.submit(package) {
            tracing::warn!(%session, "message dropped: {}", e);
        }
    }

    /// Flush transport residue, then encode and send queued responses until
    /// the transport pushes back.
    fn write_pending(
        &self,
        active: &mut ActiveSession<L::Connection, A::Message, A::Context>,
    ) -> io::Result<()> {
        if active.transport.flush()? == Sent::WouldBlock {
            return Ok(());
        }

        loop {
            let frame = match active.pending_frame.take() {
                Some(frame) => frame,
                None => match active.outgoing.pop_front() {
                    Some(message) => match self.codec.encode(&message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let session = active.handle.id();
                            tracing::warn!(%session, "dropping response: {}", e);
                            continue;
                        },
                    },
                    None => return Ok(()),
                },
            };

            match active.transport.send(&frame)? {
                Sent::Written => {
                    let session = active.handle.id();
                    tracing::trace!(%session, len = frame.len(), "response written");
                    if active.transport.pending_io().contains(Readiness::WRITE) {
                        return Ok(());
                    }
                },
                Sent::WouldBlock => {
                    active.pending_frame = Some(frame);
                    return Ok(());
                },
            }
        }
    }

    /// Push the interest mask matching the session state, or tear a closing
    /// session down once it has nothing left to write.
    fn settle(
        &mut self,
        id: SessionId,
        active: Box<ActiveSession<L::Connection, A::Message, A::Context>>,
    ) {
        if active.closing && !active.wants_write() {
            self.teardown(id, Session::Active(active), "closed by application");
            return;
        }

        match self.mux.set_interest(active.channel, active.interest()) {
            Ok(()) => {
                self.sessions.insert(id, Session::Active(active));
            },
            Err(e) => {
                tracing::warn!(%id, "{}", e);
                self.teardown(id, Session::Active(active), "poller update failed");
            },
        }
    }

    fn apply_commands(&mut self) {
        for command in self.control.drain() {
            match command {
                Command::Send { session, message } => self.enqueue(session, message),
                Command::Close { session } => self.request_close(session),
            }
        }
    }

    fn enqueue(&mut self, id: SessionId, message: A::Message) {
        let mut active = match self.sessions.remove(&id) {
            Some(Session::Active(active)) if !active.closing => active,
            Some(other) => {
                tracing::debug!(
                    %id,
                    phase = ?other.phase(),
                    "dropping response for session not accepting writes"
                );
                self.sessions.insert(id, other);
                return;
            },
            None => {
                tracing::debug!(%id, "dropping response for closed session");
                return;
            },
        };

        if active.outgoing.len() >= self.config.max_outgoing {
            tracing::warn!(%id, limit = self.config.max_outgoing, "outgoing queue full");
            self.teardown(id, Session::Active(active), "outgoing queue overflow");
            return;
        }

        active.outgoing.push_back(message);
        self.settle(id, active);
    }

    fn request_close(&mut self, id: SessionId) {
        match self.sessions.remove(&id) {
            Some(Session::Active(mut active)) => {
                active.closing = true;
                self.settle(id, active);
            },
            Some(session @ Session::Handshaking(_)) => {
                self.teardown(id, session, "closed by application");
            },
            Some(listener @ Session::Listener(_)) => {
                tracing::warn!(%id, "ignoring close request for a listener");
                self.sessions.insert(id, listener);
            },
            None => tracing::debug!(%id, "close requested for closed session"),
        }
    }

    /// Unregister the channel, then close the transport.
    fn teardown(
        &mut self,
        id: SessionId,
        mut session: Session<L, A::Message, A::Context>,
        reason: &str,
    ) {
        if let Err(e) = self.mux.unregister(session.channel()) {
            tracing::debug!(%id, "{}", e);
        }
        session.close();

        if session.phase() != Phase::Listener {
            self.connections -= 1;
        }
        tracing::info!(%id, reason, "session closed");
    }
}

impl<P, L, Cd, A> Drop for Server<P, L, Cd, A>
where
    P: Poller,
    L: Listener<Descriptor = P::Descriptor>,
    Cd: Codec<Message = A::Message>,
    A: Application,
{
    fn drop(&mut self) {
        // Workers may still hold packages; stop them before closing transports.
        self.pool.shutdown();

        for (id, mut session) in self.sessions.drain() {
            if let Err(e) = self.mux.unregister(session.channel()) {
                tracing::debug!(%id, "{}", e);
            }
            session.close();
        }
        self.connections = 0;
    }
}

impl<P, L, Cd, A> fmt::Debug for Server<P, L, Cd, A>
where
    P: Poller,
    L: Listener<Descriptor = P::Descriptor>,
    Cd: Codec<Message = A::Message>,
    A: Application,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.sessions.len())
            .field("connections", &self.connections)
            .field("mux", &self.mux)
            .field("pool", &self.pool)
            .field("stopping", &self.control.is_stopping())
            .finish_non_exhaustive()
    }
}
