//! Error types for the switchyard core.
//!
//! Strongly-typed errors per layer: the multiplexer (poller registration and
//! polling), the worker pool (thread spawn, submission), framing and codecs,
//! and the server loop that composes them.
//!
//! Per-connection failures are not represented here. They are handled locally
//! by tearing the session down and never reach the caller of `run`.

use std::{fmt, io};

use thiserror::Error;

use crate::multiplexer::ChannelId;

/// Errors from the channel multiplexer.
#[derive(Error, Debug)]
pub enum MultiplexerError {
    /// The poller refused a new registration.
    ///
    /// Usually descriptor or memory exhaustion. Fatal for the connection
    /// attempt that asked for it, not for the server.
    #[error("poller registration failed: {0}")]
    Register(#[source] io::Error),

    /// The poller refused an interest update for a live channel.
    #[error("poller update failed for {channel}: {source}")]
    Update {
        /// Channel whose interest could not be changed
        channel: ChannelId,
        /// Underlying poller error
        #[source]
        source: io::Error,
    },

    /// Descriptor is already owned by another live channel.
    ///
    /// Registering it twice would make readiness ambiguous. Logic bug in the
    /// caller.
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(String),

    /// Channel handle is stale (unregistered, slot possibly reused).
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The blocking poll call failed.
    ///
    /// Terminal: the server loop stops serving.
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

impl MultiplexerError {
    /// Returns true if the event loop cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Poll(_))
    }
}

/// Errors creating a worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Pool was configured with zero threads.
    #[error("worker pool needs at least one thread")]
    NoThreads,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Work item rejected by [`crate::WorkerPool::submit`].
///
/// The rejected item is handed back so the caller decides how to release it.
pub enum SubmitError<T> {
    /// Pool is shutting down.
    Closed(T),

    /// Queue reached its configured capacity.
    Full(T),
}

impl<T> SubmitError<T> {
    /// Take back the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) | Self::Full(item) => item,
        }
    }
}

impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Full(_) => f.write_str("Full(..)"),
        }
    }
}

impl<T> fmt::Display for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "worker pool is shut down"),
            Self::Full(_) => write!(f, "worker queue is full"),
        }
    }
}

impl<T> std::error::Error for SubmitError<T> {}

/// Length-prefixed framing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Announced body length exceeds the configured maximum.
    ///
    /// The peer is broken or hostile; the connection should be dropped.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Length announced by the header
        len: usize,
        /// Configured maximum
        max: usize,
    },
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// Message codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Received bytes are not a valid message. The message is dropped, the
    /// session stays open.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A response could not be serialized. The response is dropped.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Errors that stop a server from being created or from running.
#[derive(Error, Debug)]
pub enum ServerError {
    /// No listen addresses configured.
    #[error("no listen addresses configured")]
    NoListeners,

    /// Creating or binding a listener failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address that failed
        address: String,
        /// Underlying transport error
        #[source]
        source: io::Error,
    },

    /// Multiplexer failure (listener registration at startup, or poll).
    #[error("multiplexer error: {0}")]
    Multiplexer(#[from] MultiplexerError),

    /// Worker pool could not be started.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Poller wake-up handle could not be created.
    #[error("failed to create poller notifier: {0}")]
    Notifier(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_poll_errors_are_fatal() {
        assert!(MultiplexerError::Poll(io::Error::other("epoll")).is_fatal());
        assert!(!MultiplexerError::Register(io::Error::other("EMFILE")).is_fatal());
        assert!(!MultiplexerError::AlreadyRegistered("7".to_string()).is_fatal());
    }

    #[test]
    fn submit_error_returns_item() {
        let err = SubmitError::Full(42);
        assert_eq!(err.to_string(), "worker queue is full");
        assert_eq!(err.into_inner(), 42);

        let err = SubmitError::Closed("job");
        assert_eq!(err.to_string(), "worker pool is shut down");
        assert_eq!(err.into_inner(), "job");
    }

    #[test]
    fn frame_error_maps_to_invalid_data() {
        let err: io::Error = FrameError::TooLarge { len: 10, max: 4 }.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds limit of 4");
    }

    #[test]
    fn server_error_display() {
        let err = ServerError::Bind {
            address: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "failed to bind 127.0.0.1:1: in use");
        assert_eq!(ServerError::NoListeners.to_string(), "no listen addresses configured");
    }
}
