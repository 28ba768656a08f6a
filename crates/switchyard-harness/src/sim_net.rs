//! Simulated network.
//!
//! All simulated listeners, connections and poller registrations share one
//! [`SimNet`]. Tests act as the remote peers through [`SimClient`] handles,
//! the server side sees the same state through `SimListener`/`SimTransport`
//! and `SimPoller`.
//!
//! Readiness is level-triggered and computed from state: a listener is
//! readable while its backlog is non-empty, a connection is readable while
//! inbound chunks are queued and writable while the peer accepts writes.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    io,
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};
use switchyard_core::{Handshake, Readiness, framing};

/// Descriptor type used by every simulated endpoint.
pub type SimDescriptor = u64;

/// One step of a scripted transport handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Still negotiating; wait for this readiness next.
    Pending(Readiness),
    /// Handshake completes.
    Done,
    /// Handshake fails with an I/O error.
    Fail,
}

/// How a simulated connection behaves on the server side.
#[derive(Debug, Clone, Default)]
pub struct ConnectionScript {
    need: Readiness,
    steps: Vec<HandshakeStep>,
    data: Vec<Bytes>,
}

impl ConnectionScript {
    /// Connection that is established as soon as it is accepted.
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Connection whose transport needs `need` before the first handshake
    /// step, then runs `steps` in order. Running out of steps completes it.
    pub fn handshake(need: Readiness, steps: impl IntoIterator<Item = HandshakeStep>) -> Self {
        Self { need, steps: steps.into_iter().collect(), data: Vec::new() }
    }

    /// Frame bodies the peer sends right away, e.g. in the same flight as the
    /// last handshake message.
    #[must_use]
    pub fn with_frames(mut self, bodies: impl IntoIterator<Item = Bytes>) -> Self {
        self.data.extend(bodies);
        self
    }
}

#[derive(Debug)]
pub(crate) enum Chunk {
    Data(Bytes),
    Close,
    Fail,
}

#[derive(Debug)]
pub(crate) struct ConnState {
    pub need: Readiness,
    pub steps: VecDeque<HandshakeStep>,
    pub inbound: VecDeque<Chunk>,
    /// Framed bytes written by the server
    pub wire: BytesMut,
    /// Tail of a frame the wire has not taken yet
    pub residue: BytesMut,
    /// Bytes the wire takes per write call, `None` for no limit
    pub write_limit: Option<usize>,
    pub writes: usize,
    pub writable: bool,
    pub closed_by_server: bool,
    pub handshake_attempts: usize,
}

impl ConnState {
    pub fn new(need: Readiness, steps: VecDeque<HandshakeStep>, inbound: VecDeque<Chunk>) -> Self {
        Self {
            need,
            steps,
            inbound,
            wire: BytesMut::new(),
            residue: BytesMut::new(),
            write_limit: None,
            writes: 0,
            writable: true,
            closed_by_server: false,
            handshake_attempts: 0,
        }
    }

    /// Move as much of `bytes` onto the wire as one write call takes.
    pub fn write_some(&mut self, bytes: &[u8]) -> usize {
        let taken = self.write_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
        self.wire.extend_from_slice(&bytes[..taken]);
        taken
    }

    /// Readiness the transport needs, partial-write residue included.
    pub fn pending_io(&self) -> Readiness {
        if self.residue.is_empty() { self.need } else { self.need | Readiness::WRITE }
    }

    pub fn continue_handshake(&mut self) -> io::Result<Handshake> {
        self.handshake_attempts += 1;
        match self.steps.pop_front() {
            Some(HandshakeStep::Pending(need)) => {
                self.need = need;
                Ok(Handshake::Pending(need))
            },
            Some(HandshakeStep::Done) | None => {
                self.need = Readiness::empty();
                Ok(Handshake::Done)
            },
            Some(HandshakeStep::Fail) => {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "handshake rejected"))
            },
        }
    }

    fn readiness(&self) -> Readiness {
        let mut ready = Readiness::empty();
        if !self.inbound.is_empty() {
            ready |= Readiness::READ;
        }
        if self.writable && !self.closed_by_server {
            ready |= Readiness::WRITE;
        }
        ready
    }
}

#[derive(Debug)]
pub(crate) struct ListenerState {
    pub address: String,
    pub backlog: VecDeque<SimDescriptor>,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Registration {
    pub token: u64,
    pub interest: Readiness,
}

#[derive(Debug, Default)]
pub(crate) struct NetState {
    next_descriptor: SimDescriptor,
    pub registrations: BTreeMap<SimDescriptor, Registration>,
    pub listeners: HashMap<SimDescriptor, ListenerState>,
    pub bound: HashMap<String, SimDescriptor>,
    pub refused: HashSet<String>,
    pub connections: HashMap<SimDescriptor, ConnState>,
    pub forced: HashMap<SimDescriptor, Readiness>,
    pub wake_pending: bool,
    pub polls: usize,
    pub timed_out_polls: Vec<Duration>,
    pub duplicate_registrations: usize,
    pub peak_registrations: usize,
}

impl NetState {
    fn allocate(&mut self) -> SimDescriptor {
        self.next_descriptor += 1;
        self.next_descriptor
    }

    /// Current readiness of a descriptor, forced bits included.
    pub fn readiness(&self, descriptor: SimDescriptor) -> Readiness {
        let mut ready = self.forced.get(&descriptor).copied().unwrap_or_default();
        if let Some(listener) = self.listeners.get(&descriptor) {
            if !listener.closed && !listener.backlog.is_empty() {
                ready |= Readiness::READ;
            }
        }
        if let Some(conn) = self.connections.get(&descriptor) {
            ready |= conn.readiness();
        }
        ready
    }
}

pub(crate) struct Shared {
    pub state: Mutex<NetState>,
    pub changed: Condvar,
}

/// Shared simulated network.
#[derive(Clone)]
pub struct SimNet {
    pub(crate) shared: Arc<Shared>,
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNet {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(NetState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NetState> {
        self.shared.state.lock()
    }

    /// Mutate state and wake anyone blocked in a poll.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut NetState) -> R) -> R {
        let result = f(&mut self.lock());
        self.shared.changed.notify_all();
        result
    }

    /// Make every later bind of `address` fail.
    pub fn refuse_bind(&self, address: &str) {
        self.lock().refused.insert(address.to_string());
    }

    /// Bind a listener.
    pub fn bind(&self, address: &str) -> io::Result<crate::SimListener> {
        let descriptor = {
            let mut state = self.lock();
            if state.refused.contains(address) || state.bound.contains_key(address) {
                let message = format!("{address} unavailable");
                return Err(io::Error::new(io::ErrorKind::AddrInUse, message));
            }
            let descriptor = state.allocate();
            let listener = ListenerState {
                address: address.to_string(),
                backlog: VecDeque::new(),
                closed: false,
            };
            state.listeners.insert(descriptor, listener);
            state.bound.insert(address.to_string(), descriptor);
            descriptor
        };
        tracing::trace!(address, descriptor, "sim listener bound");
        Ok(crate::SimListener::new(self.clone(), descriptor, address.to_string()))
    }

    /// Open a connection to a bound listener.
    pub fn connect(&self, address: &str, script: ConnectionScript) -> io::Result<SimClient> {
        let descriptor = self.update(|state| -> io::Result<SimDescriptor> {
            let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, address.to_string());
            let listener = *state.bound.get(address).ok_or_else(refused)?;

            let descriptor = state.allocate();
            let mut inbound = VecDeque::new();
            for body in script.data {
                inbound.push_back(Chunk::Data(frame(&body)?));
            }
            state
                .connections
                .insert(descriptor, ConnState::new(script.need, script.steps.into(), inbound));
            if let Some(listener) = state.listeners.get_mut(&listener) {
                listener.backlog.push_back(descriptor);
            }
            Ok(descriptor)
        })?;

        Ok(SimClient { net: self.clone(), descriptor })
    }

    /// Report `readiness` on `descriptor` at the next poll, once.
    pub fn force_ready(&self, descriptor: SimDescriptor, readiness: Readiness) {
        self.update(|state| {
            *state.forced.entry(descriptor).or_default() |= readiness;
        });
    }

    /// Number of poll calls issued so far.
    pub fn polls(&self) -> usize {
        self.lock().polls
    }

    /// Timeouts of the polls that returned without events.
    pub fn timed_out_polls(&self) -> Vec<Duration> {
        self.lock().timed_out_polls.clone()
    }

    /// Descriptors currently registered with the simulated poller.
    pub fn registered(&self) -> usize {
        self.lock().registrations.len()
    }

    /// Largest number of simultaneous registrations seen.
    pub fn peak_registrations(&self) -> usize {
        self.lock().peak_registrations
    }

    /// Number of `add` calls for an already registered descriptor.
    pub fn duplicate_registrations(&self) -> usize {
        self.lock().duplicate_registrations
    }

    /// True if `descriptor` is registered with the simulated poller.
    pub fn is_registered(&self, descriptor: SimDescriptor) -> bool {
        self.lock().registrations.contains_key(&descriptor)
    }

    /// Interest registered for `descriptor`.
    pub fn interest(&self, descriptor: SimDescriptor) -> Option<Readiness> {
        self.lock().registrations.get(&descriptor).map(|r| r.interest)
    }

    /// True if the listener bound to `address` has been closed.
    pub fn listener_closed(&self, address: &str) -> bool {
        let state = self.lock();
        state.listeners.values().any(|l| l.address == address && l.closed)
    }

    /// Allocate a descriptor not tied to any endpoint, for poller-level tests.
    pub fn raw_descriptor(&self) -> SimDescriptor {
        self.lock().allocate()
    }
}

/// Peer side of a simulated connection.
#[derive(Clone)]
pub struct SimClient {
    net: SimNet,
    descriptor: SimDescriptor,
}

impl SimClient {
    /// Descriptor the server sees for this connection.
    pub fn descriptor(&self) -> SimDescriptor {
        self.descriptor
    }

    /// Send one length-prefixed frame.
    pub fn send_frame(&self, body: &[u8]) -> io::Result<()> {
        let framed = frame(body)?;
        self.send_raw(&framed);
        Ok(())
    }

    /// Send raw bytes, possibly a partial frame.
    pub fn send_raw(&self, bytes: &[u8]) {
        let chunk = Chunk::Data(Bytes::copy_from_slice(bytes));
        self.with_conn(|conn| conn.inbound.push_back(chunk));
    }

    /// Close the connection from the peer side.
    pub fn hang_up(&self) {
        self.with_conn(|conn| conn.inbound.push_back(Chunk::Close));
    }

    /// Make the next read on the server side fail.
    pub fn reset(&self) {
        self.with_conn(|conn| conn.inbound.push_back(Chunk::Fail));
    }

    /// Whether server writes are accepted (`false` makes them `WouldBlock`).
    pub fn set_writable(&self, writable: bool) {
        self.with_conn(|conn| conn.writable = writable);
    }

    /// Readiness the server-side transport reports it needs while active,
    /// e.g. a write to make progress on a read.
    pub fn set_need(&self, need: Readiness) {
        self.with_conn(|conn| conn.need = need);
    }

    /// Cap the bytes one server write call puts on the wire. The rest of a
    /// frame stays buffered in the transport until flushed.
    pub fn limit_writes(&self, limit: Option<usize>) {
        self.with_conn(|conn| conn.write_limit = limit);
    }

    /// Bytes of a partly written frame still held by the transport.
    pub fn residue(&self) -> usize {
        self.net.lock().connections.get(&self.descriptor).map_or(0, |c| c.residue.len())
    }

    /// Complete frame bodies written by the server so far.
    pub fn received(&self) -> Vec<Bytes> {
        let state = self.net.lock();
        let Some(conn) = state.connections.get(&self.descriptor) else {
            return Vec::new();
        };

        let mut wire = conn.wire.clone();
        let mut bodies = Vec::new();
        while let Ok(Some(len)) = framing::split_frame(&mut wire, usize::MAX) {
            bodies.push(wire.split_to(len).freeze());
        }
        bodies
    }

    /// Number of `send` calls the server side accepted.
    pub fn writes(&self) -> usize {
        self.net.lock().connections.get(&self.descriptor).map_or(0, |c| c.writes)
    }

    /// Number of handshake steps the server drove.
    pub fn handshake_attempts(&self) -> usize {
        self.net.lock().connections.get(&self.descriptor).map_or(0, |c| c.handshake_attempts)
    }

    /// True once the server closed its end.
    pub fn is_closed(&self) -> bool {
        self.net.lock().connections.get(&self.descriptor).is_some_and(|c| c.closed_by_server)
    }

    fn with_conn(&self, f: impl FnOnce(&mut ConnState)) {
        self.net.update(|state| {
            if let Some(conn) = state.connections.get_mut(&self.descriptor) {
                f(conn);
            }
        });
    }
}

fn frame(body: &[u8]) -> io::Result<Bytes> {
    let mut out = BytesMut::new();
    framing::put_frame(body, &mut out, framing::DEFAULT_MAX_FRAME_LEN)?;
    Ok(out.freeze())
}
