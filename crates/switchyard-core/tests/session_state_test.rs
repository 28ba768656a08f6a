//! Session state machine: accept, handshake, activation, teardown.

use std::time::Duration;

use switchyard_core::{Flow, Phase, Readiness, ServerConfig, ServerError, SessionId};
use switchyard_harness::{
    ConnectionScript, HandshakeStep, RecordingApp, SimNet, SimServer, TextCodec, TextMessage,
    run_until, sim_config, sim_server,
};

const ADDR: &str = "sim:4433";

fn server(net: &SimNet, app: &RecordingApp) -> SimServer {
    sim_server(net, sim_config(&[ADDR]), TextCodec::new(), app.clone()).unwrap()
}

fn only_connection(server: &SimServer) -> SessionId {
    let connections: Vec<_> =
        server.sessions().into_iter().filter(|(_, phase)| *phase != Phase::Listener).collect();
    assert_eq!(connections.len(), 1, "expected exactly one connection: {connections:?}");
    connections[0].0
}

#[test]
fn immediate_accept_goes_straight_to_active_with_read_interest() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let mut server = server(&net, &app);
    let client = net.connect(ADDR, ConnectionScript::immediate()).unwrap();

    assert_eq!(server.run_once().unwrap(), Flow::Continue);

    let id = only_connection(&server);
    assert_eq!(server.phase(id), Some(Phase::Active));
    assert_eq!(server.interest(id), Some(Readiness::READ));
    assert_eq!(net.interest(client.descriptor()), Some(Readiness::READ));
    assert_eq!(app.opened(), vec![id]);
    assert_eq!(client.handshake_attempts(), 0);
}

#[test]
fn handshake_follows_transport_needs_then_activates_once() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let mut server = server(&net, &app);
    let client = net
        .connect(
            ADDR,
            ConnectionScript::handshake(
                Readiness::WRITE,
                [HandshakeStep::Pending(Readiness::WRITE), HandshakeStep::Done],
            ),
        )
        .unwrap();

    server.run_once().unwrap();
    let id = only_connection(&server);
    assert_eq!(server.phase(id), Some(Phase::Handshaking));
    assert_eq!(server.interest(id), Some(Readiness::WRITE));
    assert!(app.opened().is_empty(), "no context before the handshake completes");

    server.run_once().unwrap();
    assert_eq!(server.phase(id), Some(Phase::Handshaking));
    assert_eq!(client.handshake_attempts(), 1);

    server.run_once().unwrap();
    assert_eq!(server.phase(id), Some(Phase::Active));
    assert_eq!(server.interest(id), Some(Readiness::READ));
    assert_eq!(client.handshake_attempts(), 2);
    assert_eq!(app.opened(), vec![id]);
}

#[test]
fn handshake_interest_switches_direction() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let mut server = server(&net, &app);
    let client = net
        .connect(
            ADDR,
            ConnectionScript::handshake(
                Readiness::WRITE,
                [HandshakeStep::Pending(Readiness::READ), HandshakeStep::Done],
            ),
        )
        .unwrap();

    server.run_once().unwrap();
    server.run_once().unwrap();
    let id = only_connection(&server);
    assert_eq!(server.interest(id), Some(Readiness::READ));

    // The peer's next handshake flight makes the channel readable.
    client.send_raw(&[]);
    server.run_once().unwrap();
    assert_eq!(server.phase(id), Some(Phase::Active));
    assert_eq!(app.opened(), vec![id]);
}

#[test]
fn failed_handshake_destroys_only_that_session() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let mut server = server(&net, &app);
    let good = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    let bad = net
        .connect(ADDR, ConnectionScript::handshake(Readiness::WRITE, [HandshakeStep::Fail]))
        .unwrap();

    server.run_once().unwrap();
    assert_eq!(server.session_count(), 2);

    assert!(run_until(&mut server, 5, |s| s.session_count() == 1).unwrap());
    assert!(bad.is_closed());
    assert!(!net.is_registered(bad.descriptor()));
    assert!(!good.is_closed());
    assert_eq!(app.opened().len(), 1);
}

#[test]
fn handshake_timeout_closes_session() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let config =
        ServerConfig { handshake_timeout: Some(Duration::from_millis(25)), ..sim_config(&[ADDR]) };
    let mut server = sim_server(&net, config, TextCodec::new(), app.clone()).unwrap();
    let client = net
        .connect(ADDR, ConnectionScript::handshake(Readiness::READ, [HandshakeStep::Done]))
        .unwrap();

    server.run_once().unwrap();
    assert_eq!(server.session_count(), 1);

    server.run_once().unwrap();
    assert_eq!(server.session_count(), 0);
    assert!(client.is_closed());
    assert_eq!(net.timed_out_polls(), vec![Duration::from_millis(25)]);
    assert!(app.opened().is_empty());
}

#[test]
fn frames_arriving_with_the_handshake_are_dispatched() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let mut server = server(&net, &app);
    let ping = TextCodec::body(&TextMessage::Ping("early".to_string()));
    let script =
        ConnectionScript::handshake(Readiness::WRITE, [HandshakeStep::Done]).with_frames([ping]);
    let client = net.connect(ADDR, script).unwrap();

    assert!(run_until(&mut server, 10, |_| client.writes() == 1).unwrap());
    assert_eq!(app.handled().len(), 1);
    assert_eq!(client.received(), vec![TextCodec::body(&TextMessage::Pong("early".to_string()))]);
}

#[test]
fn connections_beyond_the_limit_are_refused() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let config = ServerConfig { max_sessions: 1, ..sim_config(&[ADDR]) };
    let mut server = sim_server(&net, config, TextCodec::new(), app.clone()).unwrap();
    let first = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    let second = net.connect(ADDR, ConnectionScript::immediate()).unwrap();

    server.run_once().unwrap();

    assert_eq!(server.session_count(), 1);
    assert!(!first.is_closed());
    assert!(second.is_closed());
    assert!(!net.is_registered(second.descriptor()));
}

#[test]
fn bind_failure_tears_down_earlier_listeners() {
    let net = SimNet::new();
    net.refuse_bind("sim:2");

    let config = sim_config(&["sim:1", "sim:2"]);
    let result = sim_server(&net, config, TextCodec::new(), RecordingApp::new());

    match result {
        Err(ServerError::Bind { address, .. }) => assert_eq!(address, "sim:2"),
        other => panic!("expected a bind error, got {:?}", other.map(|_| ())),
    }
    assert!(net.listener_closed("sim:1"));
    assert_eq!(net.registered(), 0);
}

#[test]
fn empty_listen_list_is_rejected() {
    let net = SimNet::new();
    let result = sim_server(&net, sim_config(&[]), TextCodec::new(), RecordingApp::new());
    assert!(matches!(result, Err(ServerError::NoListeners)));
}

#[test]
fn listeners_report_their_bound_addresses() {
    let net = SimNet::new();
    let config = sim_config(&["sim:1", "sim:2"]);
    let server = sim_server(&net, config, TextCodec::new(), RecordingApp::new()).unwrap();

    assert_eq!(server.listener_addresses(), vec!["sim:1".to_string(), "sim:2".to_string()]);
    assert_eq!(server.session_count(), 0);
    assert_eq!(net.registered(), 2);
    assert!(server.sessions().iter().all(|(_, phase)| *phase == Phase::Listener));
}

#[test]
fn dropping_the_server_closes_everything() {
    let net = SimNet::new();
    let app = RecordingApp::new();
    let mut server = server(&net, &app);
    let client = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    server.run_once().unwrap();

    drop(server);

    assert!(client.is_closed());
    assert!(net.listener_closed(ADDR));
    assert_eq!(net.registered(), 0);
    assert!(net.connect(ADDR, ConnectionScript::immediate()).is_err());
}
