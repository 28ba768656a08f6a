//! Simulated listener and transport.
//!
//! Server-side views of [`SimNet`] endpoints. Streams use the core's
//! length-prefixed framing, so frames may arrive split across any number of
//! chunks.

use std::io;

use bytes::{Buf, BytesMut};
use switchyard_core::{
    Accepted, Handshake, Listener, Readiness, Received, Sent, Transport, framing,
};

use crate::sim_net::{Chunk, ConnState, SimDescriptor, SimNet};

/// Simulated listening endpoint.
pub struct SimListener {
    net: SimNet,
    descriptor: SimDescriptor,
    address: String,
}

impl SimListener {
    pub(crate) fn new(net: SimNet, descriptor: SimDescriptor, address: String) -> Self {
        Self { net, descriptor, address }
    }
}

impl Listener for SimListener {
    type Descriptor = SimDescriptor;
    type Connection = SimTransport;

    fn descriptor(&self) -> SimDescriptor {
        self.descriptor
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }

    fn accept(&mut self) -> io::Result<Accepted<SimTransport>> {
        let next = self
            .net
            .lock()
            .listeners
            .get_mut(&self.descriptor)
            .filter(|listener| !listener.closed)
            .and_then(|listener| listener.backlog.pop_front());

        Ok(match next {
            Some(descriptor) => Accepted::Connection(SimTransport {
                net: self.net.clone(),
                descriptor,
                max_frame_len: framing::DEFAULT_MAX_FRAME_LEN,
            }),
            None => Accepted::Pending,
        })
    }

    fn close(&mut self) {
        self.net.update(|state| {
            if let Some(listener) = state.listeners.get_mut(&self.descriptor) {
                listener.closed = true;
            }
            state.bound.remove(&self.address);
        });
    }
}

/// Simulated connection, server side.
pub struct SimTransport {
    net: SimNet,
    descriptor: SimDescriptor,
    max_frame_len: usize,
}

impl Transport for SimTransport {
    type Descriptor = SimDescriptor;

    fn descriptor(&self) -> SimDescriptor {
        self.descriptor
    }

    fn pending_io(&self) -> Readiness {
        let state = self.net.lock();
        state.connections.get(&self.descriptor).map_or(Readiness::empty(), ConnState::pending_io)
    }

    fn continue_handshake(&mut self) -> io::Result<Handshake> {
        self.net.update(|state| match state.connections.get_mut(&self.descriptor) {
            Some(conn) => conn.continue_handshake(),
            None => Err(io::ErrorKind::NotConnected.into()),
        })
    }

    fn receive(&mut self, input: &mut BytesMut) -> io::Result<Received> {
        let mut state = self.net.lock();
        let conn = state
            .connections
            .get_mut(&self.descriptor)
            .ok_or(io::ErrorKind::NotConnected)?;

        while let Some(Chunk::Data(_)) = conn.inbound.front() {
            if let Some(Chunk::Data(bytes)) = conn.inbound.pop_front() {
                input.extend_from_slice(&bytes);
            }
        }

        if let Some(len) = framing::split_frame(input, self.max_frame_len)? {
            return Ok(Received::Complete(len));
        }

        match conn.inbound.pop_front() {
            Some(Chunk::Close) => Ok(Received::Closed),
            Some(Chunk::Fail) => Err(io::ErrorKind::ConnectionReset.into()),
            Some(chunk @ Chunk::Data(_)) => {
                conn.inbound.push_front(chunk);
                Ok(Received::Incomplete)
            },
            None => Ok(Received::Incomplete),
        }
    }

    fn has_buffered(&self, input: &[u8]) -> bool {
        framing::has_frame(input, self.max_frame_len)
            || self
                .net
                .lock()
                .connections
                .get(&self.descriptor)
                .is_some_and(|c| !c.inbound.is_empty())
    }

    fn send(&mut self, message: &[u8]) -> io::Result<Sent> {
        let mut state = self.net.lock();
        let conn = state
            .connections
            .get_mut(&self.descriptor)
            .ok_or(io::ErrorKind::NotConnected)?;

        if conn.closed_by_server {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if !conn.writable || !conn.residue.is_empty() {
            return Ok(Sent::WouldBlock);
        }

        let mut frame = BytesMut::new();
        framing::put_frame(message, &mut frame, self.max_frame_len)?;
        let taken = conn.write_some(&frame);
        if taken == 0 {
            return Ok(Sent::WouldBlock);
        }
        frame.advance(taken);
        conn.residue = frame;
        conn.writes += 1;
        Ok(Sent::Written)
    }

    fn flush(&mut self) -> io::Result<Sent> {
        let mut state = self.net.lock();
        let conn = state
            .connections
            .get_mut(&self.descriptor)
            .ok_or(io::ErrorKind::NotConnected)?;

        if conn.residue.is_empty() {
            return Ok(Sent::Written);
        }
        if conn.closed_by_server {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if !conn.writable {
            return Ok(Sent::WouldBlock);
        }

        let residue = std::mem::take(&mut conn.residue);
        let taken = conn.write_some(&residue);
        conn.residue = residue;
        conn.residue.advance(taken);
        if conn.residue.is_empty() { Ok(Sent::Written) } else { Ok(Sent::WouldBlock) }
    }

    fn close(&mut self) {
        self.net.update(|state| {
            if let Some(conn) = state.connections.get_mut(&self.descriptor) {
                conn.closed_by_server = true;
            }
        });
    }
}
