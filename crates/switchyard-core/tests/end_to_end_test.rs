//! Request / response flow through the worker pool and back out.

use std::{thread, time::Duration};

use switchyard_core::{Phase, Readiness, ServerConfig, SessionId, framing};
use switchyard_harness::{
    ConnectionScript, RecordingApp, SimClient, SimNet, SimServer, TextCodec, TextMessage, run_until,
    sim_config, sim_server,
};

const ADDR: &str = "sim:9000";

fn ping(payload: &str) -> Vec<u8> {
    TextCodec::body(&TextMessage::Ping(payload.to_string())).to_vec()
}

fn start(net: &SimNet, config: ServerConfig, codec: &TextCodec, app: &RecordingApp) -> SimServer {
    sim_server(net, config, codec.clone(), app.clone()).unwrap()
}

fn accept(server: &mut SimServer, net: &SimNet, app: &RecordingApp) -> (SimClient, SessionId) {
    let client = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    let before = app.opened().len();
    assert!(run_until(server, 5, |_| app.opened().len() > before).unwrap());
    let id = *app.opened().last().unwrap();
    (client, id)
}

#[test]
fn ping_yields_exactly_one_pong_and_session_stays_open() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);

    let body = ping("hello");
    assert_eq!(body.len(), 10);
    client.send_frame(&body).unwrap();

    assert!(run_until(&mut server, 10, |_| client.writes() == 1).unwrap());

    assert_eq!(codec.decodes(), 1);
    assert_eq!(app.handled(), vec![(id, TextMessage::Ping("hello".to_string()))]);
    assert_eq!(client.received(), vec![TextCodec::body(&TextMessage::Pong("hello".to_string()))]);
    assert_eq!(server.phase(id), Some(Phase::Active));
    assert_eq!(server.interest(id), Some(Readiness::READ), "write interest dropped once flushed");
    assert_eq!(server.outgoing_len(id), Some(0));
    assert!(!client.is_closed());
}

#[test]
fn quit_closes_the_session() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);

    client.send_frame(&ping("first")).unwrap();
    assert!(run_until(&mut server, 10, |_| client.writes() == 1).unwrap());

    client.send_frame(&TextCodec::body(&TextMessage::Quit)).unwrap();
    assert!(run_until(&mut server, 10, |s| s.phase(id).is_none()).unwrap());

    assert!(client.is_closed());
    assert_eq!(server.session_count(), 0);
    assert_eq!(client.writes(), 1);
}

#[test]
fn close_waits_for_queued_responses_to_flush() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);
    client.set_writable(false);

    client.send_frame(&ping("late")).unwrap();
    assert!(run_until(&mut server, 10, |s| s.outgoing_len(id) == Some(1)).unwrap());

    server.control().close(id);
    server.run_once().unwrap();
    assert_eq!(server.phase(id), Some(Phase::Active), "still flushing");
    assert_eq!(server.interest(id), Some(Readiness::WRITE), "no reads while closing");

    client.set_writable(true);
    assert!(run_until(&mut server, 5, |s| s.phase(id).is_none()).unwrap());
    assert_eq!(client.received(), vec![TextCodec::body(&TextMessage::Pong("late".to_string()))]);
    assert!(client.is_closed());
}

#[test]
fn stop_request_ends_run() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let client = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    client.send_frame(&TextCodec::body(&TextMessage::Stop)).unwrap();

    server.run().unwrap();

    assert_eq!(app.handled().len(), 1);
    assert!(server.control().is_stopping());
}

#[test]
fn stop_from_another_thread_ends_run() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let control = server.control();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        control.stop();
    });
    server.run().unwrap();
    stopper.join().unwrap();
}

#[test]
fn would_block_keeps_response_queued_with_write_interest() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);
    client.set_writable(false);

    client.send_frame(&ping("slow")).unwrap();
    assert!(run_until(&mut server, 10, |s| s.outgoing_len(id) == Some(1)).unwrap());
    assert_eq!(server.interest(id), Some(Readiness::READ | Readiness::WRITE));

    // A spurious writable event hits a peer that still refuses writes.
    net.force_ready(client.descriptor(), Readiness::WRITE);
    server.run_once().unwrap();
    assert_eq!(client.writes(), 0);
    assert_eq!(server.outgoing_len(id), Some(1));
    assert_eq!(server.interest(id), Some(Readiness::READ | Readiness::WRITE));

    client.set_writable(true);
    assert!(run_until(&mut server, 5, |_| client.writes() == 1).unwrap());
    assert_eq!(client.received(), vec![TextCodec::body(&TextMessage::Pong("slow".to_string()))]);
    assert_eq!(server.outgoing_len(id), Some(0));
    assert_eq!(server.interest(id), Some(Readiness::READ));
}

#[test]
fn outgoing_overflow_drops_the_session() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let config = ServerConfig { max_outgoing: 1, ..sim_config(&[ADDR]) };
    let mut server = start(&net, config, &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);
    client.set_writable(false);

    client.send_frame(&ping("a")).unwrap();
    client.send_frame(&ping("b")).unwrap();
    assert!(run_until(&mut server, 10, |s| s.phase(id).is_none()).unwrap());

    assert!(client.is_closed());
    assert_eq!(client.writes(), 0);
}

#[test]
fn idle_session_times_out() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let config =
        ServerConfig { idle_timeout: Some(Duration::from_millis(50)), ..sim_config(&[ADDR]) };
    let mut server = start(&net, config, &codec, &app);
    let client = net.connect(ADDR, ConnectionScript::immediate()).unwrap();

    server.run_once().unwrap();
    assert_eq!(server.session_count(), 1);

    server.run_once().unwrap();
    assert_eq!(server.session_count(), 0);
    assert!(client.is_closed());
    assert_eq!(net.timed_out_polls(), vec![Duration::from_millis(50)]);
}

#[test]
fn responses_for_unknown_sessions_are_dropped() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);

    server.control().send(SessionId::new(999), TextMessage::Pong("lost".to_string()));
    server.run_once().unwrap();

    assert_eq!(server.phase(id), Some(Phase::Active));
    assert_eq!(client.writes(), 0);
    assert_eq!(server.session_count(), 1);
}

#[test]
fn sessions_get_their_own_responses() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (alice, _) = accept(&mut server, &net, &app);
    let (bob, _) = accept(&mut server, &net, &app);

    alice.send_frame(&ping("alice")).unwrap();
    bob.send_frame(&ping("bob")).unwrap();
    assert!(run_until(&mut server, 20, |_| alice.writes() == 1 && bob.writes() == 1).unwrap());

    assert_eq!(alice.received(), vec![TextCodec::body(&TextMessage::Pong("alice".to_string()))]);
    assert_eq!(bob.received(), vec![TextCodec::body(&TextMessage::Pong("bob".to_string()))]);
}

#[test]
fn partly_written_frame_keeps_write_interest_until_flushed() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);
    client.limit_writes(Some(6));

    client.send_frame(&ping("hello")).unwrap();
    assert!(run_until(&mut server, 10, |_| client.writes() == 1).unwrap());

    // 14 framed bytes, 6 on the wire, the rest held by the transport.
    assert_eq!(client.residue(), 8);
    assert!(client.received().is_empty());
    assert_eq!(server.outgoing_len(id), Some(0));
    assert_eq!(server.interest(id), Some(Readiness::READ | Readiness::WRITE));

    assert!(run_until(&mut server, 5, |s| s.interest(id) == Some(Readiness::READ)).unwrap());
    assert_eq!(client.residue(), 0);
    assert_eq!(client.writes(), 1);
    assert_eq!(client.received(), vec![TextCodec::body(&TextMessage::Pong("hello".to_string()))]);
}

#[test]
fn incomplete_read_with_write_need_asks_for_write_interest() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let mut server = start(&net, sim_config(&[ADDR]), &codec, &app);
    let (client, id) = accept(&mut server, &net, &app);

    let mut frame = bytes::BytesMut::new();
    framing::put_frame(&ping("hello"), &mut frame, framing::DEFAULT_MAX_FRAME_LEN).unwrap();

    client.set_need(Readiness::WRITE);
    client.send_raw(&frame[..6]);
    server.run_once().unwrap();
    assert_eq!(codec.decodes(), 0);
    assert_eq!(server.interest(id), Some(Readiness::READ | Readiness::WRITE));

    // Writable again, but the transport still needs to write.
    server.run_once().unwrap();
    assert_eq!(server.interest(id), Some(Readiness::READ | Readiness::WRITE));

    client.set_need(Readiness::empty());
    server.run_once().unwrap();
    assert_eq!(server.interest(id), Some(Readiness::READ));
    assert_eq!(client.writes(), 0);

    client.send_raw(&frame[6..]);
    assert!(run_until(&mut server, 10, |_| client.writes() == 1).unwrap());
    assert_eq!(codec.decodes(), 1);
    assert_eq!(client.received(), vec![TextCodec::body(&TextMessage::Pong("hello".to_string()))]);
}
