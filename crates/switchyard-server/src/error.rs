//! Server error types.

use std::fmt;

use switchyard_core::ServerError as CoreError;

/// Errors that can occur while starting or running the TCP server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (no listen address, zero workers, etc.).
    ///
    /// Fatal, prevents startup. Fix configuration and restart.
    Config(String),

    /// Transport/network error (poller creation, socket setup).
    ///
    /// Usually fatal at startup; check the message for details.
    Transport(String),

    /// Error from the core server loop (bind failure, fatal poll error).
    ///
    /// See [`switchyard_core::ServerError`] for details.
    Core(CoreError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Core(err) => write!(f, "server error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Core(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
