//! Per-connection session state.
//!
//! ```text
//!            accept, no pending I/O
//! Listener ──────────────────────────────────────► Active
//!     │                                             ▲
//!     │ accept, handshake I/O pending                │ handshake done
//!     └─────────────────────────► Handshaking ───────┘
//!                                     │
//!                                     └── handshake error / timeout ──► closed
//! ```
//!
//! Listener sessions live until the server is dropped. Every other session is
//! torn down on transport error, peer close, idle timeout, or an application
//! close request once its queued responses are flushed.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::{
    multiplexer::ChannelId,
    package::SessionHandle,
    readiness::Readiness,
    transport::{Listener, Transport},
};

/// Externally visible lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Bound and accepting connections
    Listener,
    /// Connection accepted, transport handshake in progress
    Handshaking,
    /// Established, framing messages
    Active,
}

pub(crate) struct ListenerSession<L> {
    pub listener: L,
    pub channel: ChannelId,
    pub address: String,
}

pub(crate) struct HandshakingSession<T> {
    pub transport: T,
    pub channel: ChannelId,
}

pub(crate) struct ActiveSession<T, M, C> {
    pub transport: T,
    pub channel: ChannelId,
    pub input: BytesMut,
    pub handle: SessionHandle<C>,
    /// Responses waiting to be encoded and written
    pub outgoing: VecDeque<M>,
    /// Encoded frame the transport refused with `WouldBlock`
    pub pending_frame: Option<Bytes>,
    /// Application asked to close; no more reads, tear down once flushed
    pub closing: bool,
}

impl<T: Transport, M, C> ActiveSession<T, M, C> {
    pub fn new(transport: T, channel: ChannelId, handle: SessionHandle<C>) -> Self {
        Self {
            transport,
            channel,
            input: BytesMut::new(),
            handle,
            outgoing: VecDeque::new(),
            pending_frame: None,
            closing: false,
        }
    }

    /// True while anything is left to write, in the core or in the transport.
    pub fn wants_write(&self) -> bool {
        self.pending_frame.is_some()
            || !self.outgoing.is_empty()
            || self.transport.pending_io().contains(Readiness::WRITE)
    }

    /// Interest mask matching the current state.
    ///
    /// A closing session only waits for writability; it is torn down as soon
    /// as nothing is left to write, so the mask is never empty.
    pub fn interest(&self) -> Readiness {
        let mut interest = if self.closing { Readiness::empty() } else { Readiness::READ };
        if self.wants_write() {
            interest |= Readiness::WRITE;
        }
        interest
    }
}

pub(crate) enum Session<L: Listener, M, C> {
    Listener(ListenerSession<L>),
    Handshaking(HandshakingSession<L::Connection>),
    Active(Box<ActiveSession<L::Connection, M, C>>),
}

impl<L: Listener, M, C> Session<L, M, C> {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Listener(_) => Phase::Listener,
            Self::Handshaking(_) => Phase::Handshaking,
            Self::Active(_) => Phase::Active,
        }
    }

    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Listener(listener) => listener.channel,
            Self::Handshaking(handshaking) => handshaking.channel,
            Self::Active(active) => active.channel,
        }
    }

    /// Close the underlying listener or transport.
    pub fn close(&mut self) {
        match self {
            Self::Listener(listener) => listener.listener.close(),
            Self::Handshaking(handshaking) => handshaking.transport.close(),
            Self::Active(active) => active.transport.close(),
        }
    }
}
