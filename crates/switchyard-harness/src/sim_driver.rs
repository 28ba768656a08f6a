//! Helpers for driving a server over the simulated network.

use switchyard_core::{
    Application, Codec, Flow, Listener, Poller, Server, ServerConfig, ServerError,
};

use crate::{
    recording_app::RecordingApp, sim_net::SimNet, sim_poller::SimPoller, sim_transport::SimListener,
    text_codec::TextCodec,
};

/// Server wired to the simulated network with the text protocol.
pub type SimServer = Server<SimPoller, SimListener, TextCodec, RecordingApp>;

/// Configuration suited to simulation: few workers, no idle budgets.
///
/// Simulated time only advances when a poll has nothing to report, so idle
/// budgets would fire whenever a test waits on a worker. Tests exercising
/// timeouts set them explicitly.
pub fn sim_config(listen: &[&str]) -> ServerConfig {
    ServerConfig {
        listen: listen.iter().map(ToString::to_string).collect(),
        workers: 2,
        handshake_timeout: None,
        idle_timeout: None,
        ..ServerConfig::default()
    }
}

/// Build a [`SimServer`] whose listeners bind on `net`.
pub fn sim_server(
    net: &SimNet,
    config: ServerConfig,
    codec: TextCodec,
    app: RecordingApp,
) -> Result<SimServer, ServerError> {
    let binder = net.clone();
    Server::new(config, SimPoller::new(net), codec, app, move |address: &str| binder.bind(address))
}

/// Call `run_once` until `done` holds, the server stops, or
/// `max_iterations` iterations have run. Returns the final value of `done`.
pub fn run_until<P, L, Cd, A, F>(
    server: &mut Server<P, L, Cd, A>,
    max_iterations: usize,
    mut done: F,
) -> Result<bool, ServerError>
where
    P: Poller,
    L: Listener<Descriptor = P::Descriptor>,
    Cd: Codec<Message = A::Message>,
    A: Application,
    F: FnMut(&Server<P, L, Cd, A>) -> bool,
{
    for _ in 0..max_iterations {
        if done(server) {
            return Ok(true);
        }
        if server.run_once()? == Flow::Stopped {
            break;
        }
    }
    Ok(done(server))
}
