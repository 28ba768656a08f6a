//! Length-prefixed TCP transport over mio sockets.
//!
//! Plain TCP has no handshake, so accepted connections go straight to
//! `Active`. Reads pull from the socket until a whole frame is buffered or
//! the socket would block. A frame the socket only partly accepted stays
//! buffered here and is reported through `pending_io`.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, ToSocketAddrs},
    os::fd::{AsRawFd, RawFd},
};

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener as MioListener, TcpStream};
use switchyard_core::{
    Accepted, Handshake, Listener, Readiness, Received, Sent, Transport,
    framing::{self, DEFAULT_MAX_FRAME_LEN},
};

const READ_CHUNK: usize = 16 * 1024;

/// Socket and framing options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Largest frame body accepted or sent
    pub max_frame_len: usize,
    /// Disable Nagle's algorithm on accepted connections
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { max_frame_len: DEFAULT_MAX_FRAME_LEN, nodelay: true }
    }
}

/// Non-blocking TCP listener.
#[derive(Debug)]
pub struct TcpListener {
    inner: Option<MioListener>,
    fd: RawFd,
    address: SocketAddr,
    config: TcpConfig,
}

impl TcpListener {
    /// Bind to `address` (`host:port`, the first resolved address wins).
    pub fn bind(address: &str, config: TcpConfig) -> io::Result<Self> {
        let resolved = address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{address} did not resolve"))
        })?;
        let inner = MioListener::bind(resolved)?;
        let address = inner.local_addr()?;
        let fd = inner.as_raw_fd();
        Ok(Self { inner: Some(inner), fd, address, config })
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }
}

impl Listener for TcpListener {
    type Descriptor = RawFd;
    type Connection = TcpConnection;

    fn descriptor(&self) -> RawFd {
        self.fd
    }

    fn local_address(&self) -> String {
        self.address.to_string()
    }

    fn accept(&mut self) -> io::Result<Accepted<TcpConnection>> {
        let Some(inner) = &self.inner else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        match inner.accept() {
            Ok((stream, peer)) => {
                if self.config.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "cannot set TCP_NODELAY: {}", e);
                    }
                }
                tracing::debug!(%peer, listener = %self.address, "tcp connection accepted");
                let connection = TcpConnection::new(stream, peer, self.config.max_frame_len);
                Ok(Accepted::Connection(connection))
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Accepted::Pending),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        // Dropping the mio listener closes the socket.
        self.inner = None;
    }
}

/// One accepted TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    fd: RawFd,
    peer: SocketAddr,
    max_frame_len: usize,
    /// Unsent tail of a partially written frame
    out: BytesMut,
    eof: bool,
    closed: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream, peer: SocketAddr, max_frame_len: usize) -> Self {
        let fd = stream.as_raw_fd();
        Self { stream, fd, peer, max_frame_len, out: BytesMut::new(), eof: false, closed: false }
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write as much of `bytes` as the socket takes. Returns the number of
    /// bytes written before the socket would block.
    fn write_some(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

impl Transport for TcpConnection {
    type Descriptor = RawFd;

    fn descriptor(&self) -> RawFd {
        self.fd
    }

    fn pending_io(&self) -> Readiness {
        if self.out.is_empty() { Readiness::empty() } else { Readiness::WRITE }
    }

    fn continue_handshake(&mut self) -> io::Result<Handshake> {
        Ok(Handshake::Done)
    }

    fn receive(&mut self, input: &mut BytesMut) -> io::Result<Received> {
        loop {
            if let Some(len) = framing::split_frame(input, self.max_frame_len)? {
                return Ok(Received::Complete(len));
            }
            if self.eof {
                if !input.is_empty() {
                    let buffered = input.len();
                    tracing::debug!(peer = %self.peer, buffered, "peer closed mid-frame");
                }
                return Ok(Received::Closed);
            }

            input.reserve(READ_CHUNK);
            let start = input.len();
            input.resize(start + READ_CHUNK, 0);
            let result = self.stream.read(&mut input[start..]);
            match result {
                Ok(0) => {
                    input.truncate(start);
                    self.eof = true;
                },
                Ok(n) => input.truncate(start + n),
                Err(e) => {
                    input.truncate(start);
                    match e.kind() {
                        io::ErrorKind::Interrupted => {},
                        io::ErrorKind::WouldBlock => return Ok(Received::Incomplete),
                        _ => return Err(e),
                    }
                },
            }
        }
    }

    fn has_buffered(&self, input: &[u8]) -> bool {
        self.eof || framing::has_frame(input, self.max_frame_len)
    }

    fn send(&mut self, message: &[u8]) -> io::Result<Sent> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if !self.out.is_empty() {
            return Ok(Sent::WouldBlock);
        }

        let mut frame = BytesMut::new();
        framing::put_frame(message, &mut frame, self.max_frame_len)?;

        let written = self.write_some(&frame)?;
        if written == 0 {
            return Ok(Sent::WouldBlock);
        }
        if written < frame.len() {
            frame.advance(written);
            self.out = frame;
        }
        Ok(Sent::Written)
    }

    fn flush(&mut self) -> io::Result<Sent> {
        if self.out.is_empty() {
            return Ok(Sent::Written);
        }
        let out = std::mem::take(&mut self.out);
        let written = self.write_some(&out)?;
        self.out = out;
        self.out.advance(written);

        if self.out.is_empty() { Ok(Sent::Written) } else { Ok(Sent::WouldBlock) }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::trace!(peer = %self.peer, "shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::TcpStream as StdStream,
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    fn accept_one(listener: &mut TcpListener) -> TcpConnection {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match listener.accept().unwrap() {
                Accepted::Connection(conn) => return conn,
                Accepted::Pending => {
                    assert!(Instant::now() < deadline, "no connection arrived");
                    thread::sleep(Duration::from_millis(5));
                },
            }
        }
    }

    fn receive_until_done(conn: &mut TcpConnection, input: &mut BytesMut) -> Received {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.receive(input).unwrap() {
                Received::Incomplete => {
                    assert!(Instant::now() < deadline, "no frame arrived");
                    thread::sleep(Duration::from_millis(5));
                },
                other => return other,
            }
        }
    }

    fn pair() -> (TcpListener, TcpConnection, StdStream) {
        let mut listener = TcpListener::bind("127.0.0.1:0", TcpConfig::default()).unwrap();
        assert!(matches!(listener.accept().unwrap(), Accepted::Pending));
        let client = StdStream::connect(listener.local_addr()).unwrap();
        let conn = accept_one(&mut listener);
        (listener, conn, client)
    }

    #[test]
    fn frames_split_across_writes_are_reassembled() {
        let (_listener, mut conn, mut client) = pair();
        assert_eq!(conn.pending_io(), Readiness::empty());

        client.write_all(&[0, 0, 0, 5, b'h']).unwrap();
        client.write_all(b"ello").unwrap();

        let mut input = BytesMut::new();
        assert_eq!(receive_until_done(&mut conn, &mut input), Received::Complete(5));
        assert_eq!(&input[..5], b"hello");
        input.advance(5);
        assert!(!conn.has_buffered(&input));
    }

    #[test]
    fn send_frames_the_body() {
        let (_listener, mut conn, mut client) = pair();
        assert_eq!(conn.send(b"pong").unwrap(), Sent::Written);
        assert_eq!(conn.pending_io(), Readiness::empty());

        let mut wire = [0u8; 8];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, &[0, 0, 0, 4, b'p', b'o', b'n', b'g']);
    }

    #[test]
    fn peer_close_is_reported_after_buffered_frames() {
        let (_listener, mut conn, mut client) = pair();
        client.write_all(&[0, 0, 0, 1, b'x']).unwrap();
        drop(client);

        let mut input = BytesMut::new();
        assert_eq!(receive_until_done(&mut conn, &mut input), Received::Complete(1));
        input.advance(1);
        assert_eq!(receive_until_done(&mut conn, &mut input), Received::Closed);
        assert!(conn.has_buffered(&input));
    }

    #[test]
    fn oversized_header_is_invalid_data() {
        let mut listener = TcpListener::bind(
            "127.0.0.1:0",
            TcpConfig { max_frame_len: 8, ..TcpConfig::default() },
        )
        .unwrap();
        let mut client = StdStream::connect(listener.local_addr()).unwrap();
        let mut conn = accept_one(&mut listener);
        client.write_all(&[0, 0, 1, 0]).unwrap();

        let mut input = BytesMut::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match conn.receive(&mut input) {
                Ok(Received::Incomplete) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                },
                Ok(other) => panic!("expected an error, got {other:?}"),
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(conn.send(&[0; 9]).is_err());
    }

    #[test]
    fn closed_listener_refuses_accept() {
        let (mut listener, mut conn, _client) = pair();
        listener.close();
        assert!(listener.accept().is_err());

        conn.close();
        assert_eq!(conn.send(b"late").unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
