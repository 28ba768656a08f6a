//! Transport collaborator traits.
//!
//! The core never opens sockets or runs TLS. It drives implementations of
//! these traits from the event loop and only reacts to what they report. All
//! methods must be non-blocking.

use std::io;

use bytes::BytesMut;

use crate::readiness::Readiness;

/// Outcome of [`Listener::accept`].
#[derive(Debug)]
pub enum Accepted<T> {
    /// A new connection, possibly still needing a handshake.
    Connection(T),

    /// No connection is waiting.
    Pending,
}

/// Outcome of [`Transport::continue_handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Connection is established.
    Done,

    /// More I/O is needed; wait for this readiness and call again.
    Pending(Readiness),
}

/// Outcome of [`Transport::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// The first `len` bytes of the input buffer are one message body.
    Complete(usize),

    /// Not enough bytes yet.
    Incomplete,

    /// Peer closed the connection.
    Closed,
}

/// Outcome of [`Transport::send`] and [`Transport::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    /// Accepted. Bytes the socket did not take yet stay buffered in the
    /// transport and [`Transport::pending_io`] reports `WRITE` until flushed.
    Written,

    /// Nothing accepted; retry the same bytes on the next writable event.
    WouldBlock,
}

/// A listening endpoint.
pub trait Listener {
    /// Descriptor type registered with the poller.
    type Descriptor;

    /// Connection type produced by [`Listener::accept`].
    type Connection: Transport<Descriptor = Self::Descriptor>;

    /// Descriptor to watch for incoming connections.
    fn descriptor(&self) -> Self::Descriptor;

    /// Address actually bound (useful when binding to port 0).
    fn local_address(&self) -> String;

    /// Accept one pending connection.
    fn accept(&mut self) -> io::Result<Accepted<Self::Connection>>;

    /// Stop listening.
    fn close(&mut self);
}

/// One connected byte stream with its own framing.
pub trait Transport {
    /// Descriptor type registered with the poller.
    type Descriptor;

    /// Descriptor to watch for readiness.
    fn descriptor(&self) -> Self::Descriptor;

    /// I/O the transport still needs before it can make progress, e.g. an
    /// unfinished handshake or buffered outgoing bytes.
    fn pending_io(&self) -> Readiness;

    /// Drive the handshake one step.
    fn continue_handshake(&mut self) -> io::Result<Handshake>;

    /// Pull at most one message into `input`.
    ///
    /// On `Complete(len)` the framing header, if any, has already been
    /// removed from `input`.
    fn receive(&mut self, input: &mut BytesMut) -> io::Result<Received>;

    /// True if another [`Transport::receive`] can make progress without
    /// waiting for readiness.
    fn has_buffered(&self, input: &[u8]) -> bool;

    /// Frame and send one message body.
    fn send(&mut self, message: &[u8]) -> io::Result<Sent>;

    /// Push out bytes left over from an earlier partial write.
    fn flush(&mut self) -> io::Result<Sent>;

    /// Close the connection. Further calls may fail.
    fn close(&mut self);
}
