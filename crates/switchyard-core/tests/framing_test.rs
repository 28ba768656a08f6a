//! Framing loop: partial input, multiple frames per read, bad input.

use std::{collections::HashSet, time::Duration};

use switchyard_core::{Phase, SessionId, framing};
use switchyard_harness::{
    ConnectionScript, RecordingApp, SimClient, SimNet, SimServer, TextCodec, TextMessage, run_until,
    sim_config, sim_server,
};

const ADDR: &str = "sim:7000";

fn connected(
    net: &SimNet,
    codec: &TextCodec,
    app: &RecordingApp,
) -> (SimServer, SimClient, SessionId) {
    let mut server = sim_server(net, sim_config(&[ADDR]), codec.clone(), app.clone()).unwrap();
    let client = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    server.run_once().unwrap();
    let id = app.opened()[0];
    (server, client, id)
}

fn framed(message: &TextMessage) -> Vec<u8> {
    let mut out = bytes::BytesMut::new();
    let body = TextCodec::body(message);
    framing::put_frame(&body, &mut out, framing::DEFAULT_MAX_FRAME_LEN).unwrap();
    out.to_vec()
}

#[test]
fn incomplete_frames_are_never_decoded() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let (mut server, client, id) = connected(&net, &codec, &app);
    let frame = framed(&TextMessage::Ping("hello".to_string()));
    assert_eq!(frame.len(), framing::HEADER_LEN + 10);

    client.send_raw(&frame[..3]);
    server.run_once().unwrap();
    assert_eq!(codec.decodes(), 0);

    client.send_raw(&frame[3..9]);
    server.run_once().unwrap();
    assert_eq!(codec.decodes(), 0);
    assert_eq!(server.phase(id), Some(Phase::Active));

    client.send_raw(&frame[9..]);
    server.run_once().unwrap();
    assert_eq!(codec.decodes(), 1);
    assert!(app.wait_for_messages(1, Duration::from_secs(5)));
    assert_eq!(app.handled(), vec![(id, TextMessage::Ping("hello".to_string()))]);
}

#[test]
fn every_complete_frame_in_one_read_is_decoded_once() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let (mut server, client, _) = connected(&net, &codec, &app);

    let mut burst = Vec::new();
    for n in 0..3 {
        burst.extend(framed(&TextMessage::Echo(n.to_string())));
    }
    let tail = framed(&TextMessage::Echo("tail".to_string()));
    burst.extend(&tail[..5]);
    client.send_raw(&burst);

    server.run_once().unwrap();
    assert_eq!(codec.decodes(), 3, "one decode per complete frame, none for the partial tail");

    // Worker replies may wake the loop first, so drive until the tail lands.
    client.send_raw(&tail[5..]);
    assert!(run_until(&mut server, 10, |_| codec.decodes() == 4).unwrap());

    assert!(app.wait_for_messages(4, Duration::from_secs(5)));
    let echoed: HashSet<_> = app.handled().into_iter().map(|(_, message)| message).collect();
    let expected: HashSet<_> = ["0", "1", "2", "tail"]
        .into_iter()
        .map(|payload| TextMessage::Echo(payload.to_string()))
        .collect();
    assert_eq!(echoed, expected);
}

#[test]
fn undecodable_message_is_dropped_and_session_stays_open() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let (mut server, client, id) = connected(&net, &codec, &app);

    client.send_frame(b"JUMP:high").unwrap();
    client.send_frame(&TextCodec::body(&TextMessage::Ping("after".to_string()))).unwrap();

    assert!(run_until(&mut server, 10, |_| client.writes() == 1).unwrap());
    assert_eq!(codec.decodes(), 2);
    assert_eq!(app.handled(), vec![(id, TextMessage::Ping("after".to_string()))]);
    assert_eq!(server.phase(id), Some(Phase::Active));
    assert!(!client.is_closed());
}

#[test]
fn oversized_frame_closes_the_session() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let (mut server, client, id) = connected(&net, &codec, &app);

    let announced = u32::try_from(framing::DEFAULT_MAX_FRAME_LEN + 1).unwrap();
    client.send_raw(&announced.to_be_bytes());
    server.run_once().unwrap();

    assert_eq!(server.phase(id), None);
    assert!(client.is_closed());
    assert_eq!(codec.decodes(), 0);
}

#[test]
fn peer_close_and_reset_tear_sessions_down() {
    let net = SimNet::new();
    let codec = TextCodec::new();
    let app = RecordingApp::new();
    let (mut server, closing, _) = connected(&net, &codec, &app);
    let resetting = net.connect(ADDR, ConnectionScript::immediate()).unwrap();
    server.run_once().unwrap();
    assert_eq!(server.session_count(), 2);

    closing.hang_up();
    resetting.reset();
    assert!(run_until(&mut server, 5, |s| s.session_count() == 0).unwrap());

    assert!(closing.is_closed());
    assert!(resetting.is_closed());
    assert_eq!(net.registered(), 1, "only the listener stays registered");
}
