//! Switchyard production server.
//!
//! Glue that runs [`switchyard_core`]'s server loop over real sockets: a mio
//! poller, a length-prefixed TCP transport, and a small CBOR demo
//! application used by the binary.
//!
//! # Components
//!
//! - [`MioPoller`]: [`switchyard_core::Poller`] over `epoll`/`kqueue`
//! - [`TcpListener`] / [`TcpConnection`]: framed non-blocking TCP
//! - [`DemoApp`]: ping / echo / count / goodbye / shutdown protocol
//! - [`bind`]: build a ready-to-run [`TcpServer`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod app;
mod error;
mod poller;
mod tcp;

pub use app::{DemoApp, DemoCodec, DemoMessage};
pub use error::ServerError;
pub use poller::{MioNotify, MioPoller};
use switchyard_core::{Application, Codec, Server, ServerConfig};
pub use tcp::{TcpConfig, TcpConnection, TcpListener};

/// Server loop over mio and TCP.
pub type TcpServer<Cd, A> = Server<MioPoller, TcpListener, Cd, A>;

/// Bind every address in `config.listen` and start the worker pool.
///
/// # Errors
///
/// - `ServerError::Config` for settings the loop cannot run with
/// - `ServerError::Transport` if the poller cannot be created
/// - `ServerError::Core` if an address fails to bind
pub fn bind<Cd, A>(
    config: ServerConfig,
    tcp: &TcpConfig,
    codec: Cd,
    app: A,
) -> Result<TcpServer<Cd, A>, ServerError>
where
    Cd: Codec<Message = A::Message>,
    A: Application,
{
    if config.workers == 0 {
        return Err(ServerError::Config("at least one worker thread is required".to_string()));
    }
    if config.listen.is_empty() {
        return Err(ServerError::Config("no listen address given".to_string()));
    }
    if tcp.max_frame_len == 0 {
        return Err(ServerError::Config("max frame length must be positive".to_string()));
    }

    let poller = MioPoller::new(config.max_events)?;
    let server =
        Server::new(config, poller, codec, app, |address| TcpListener::bind(address, tcp.clone()))?;
    Ok(server)
}
