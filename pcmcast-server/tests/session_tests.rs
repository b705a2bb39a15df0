//! End-to-end session tests over loopback UDP
//!
//! Each test binds the session to 127.0.0.1:0 and drives it with plain
//! tokio sockets acting as clients.

use std::net::SocketAddr;
use std::time::Duration;

use pcmcast_common::config::ServerConfig;
use pcmcast_common::protocol::MAX_PACKET_SIZE;
use pcmcast_common::AudioPacket;
use pcmcast_server::{
    BroadcastScope, BroadcastTrigger, Error, PcmBuffer, PcmFormat, RelayEvent, Session,
    SessionState,
};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        recv_timeout: Duration::from_millis(20),
        auto_broadcast: false,
        shutdown_grace: Duration::from_secs(2),
    }
}

fn test_pcm(len: usize) -> PcmBuffer {
    let bytes: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    PcmBuffer::from_bytes(bytes, PcmFormat::RELAY)
}

async fn started_session(pcm_len: usize) -> (Session, SocketAddr) {
    let mut session = Session::new(test_pcm(pcm_len), test_config());
    let addr = session.start().await.unwrap();
    (session, addr)
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

/// Wait for the first event matching `pred`
async fn wait_for_event<F>(events: &mut broadcast::Receiver<RelayEvent>, pred: F) -> RelayEvent
where
    F: Fn(&RelayEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

/// Receive `count` packets and return (sequences, concatenated payload)
async fn receive_packets(socket: &UdpSocket, count: usize) -> (Vec<u32>, Vec<u8>) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut sequences = Vec::new();
    let mut payload = Vec::new();

    for _ in 0..count {
        let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for audio packet")
            .unwrap();
        let packet = AudioPacket::decode(&buf[..len]).unwrap();
        sequences.push(packet.sequence);
        payload.extend_from_slice(packet.payload);
    }

    (sequences, payload)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_then_enable_broadcasts_once_to_all() {
    let (mut session, server) = started_session(10_000).await;
    let mut events = session.subscribe_events();
    assert_eq!(session.state(), SessionState::Listening);

    let x = client().await;
    x.send_to(b"START", server).await.unwrap();

    let joined = wait_for_event(&mut events, |e| matches!(e, RelayEvent::ClientJoined { .. })).await;
    assert_eq!(
        joined,
        RelayEvent::ClientJoined {
            addr: x.local_addr().unwrap(),
            total: 1
        }
    );
    assert_eq!(session.registry().size().await, 1);

    let trigger = session.enable_broadcast_mode().await.unwrap();
    assert_eq!(trigger, BroadcastTrigger::Started);
    assert!(session.is_broadcast_mode());

    let (sequences, payload) = receive_packets(&x, 10).await;
    assert_eq!(sequences, (0..10).collect::<Vec<u32>>());
    assert_eq!(payload, session.pcm().as_bytes());

    let completed = wait_for_event(&mut events, |e| {
        matches!(e, RelayEvent::BroadcastCompleted { .. })
    })
    .await;
    match completed {
        RelayEvent::BroadcastCompleted { scope, report, .. } => {
            assert_eq!(scope, BroadcastScope::AllClients);
            assert_eq!(report.packets_sent, 10);
            assert!(report.completed);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Exactly one run was started
    let mut extra_runs = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RelayEvent::BroadcastStarted { .. }) {
            extra_runs += 1;
        }
    }
    assert_eq!(extra_runs, 0);

    assert!(session.shutdown().await);
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enable_without_clients_serves_later_joiners() {
    let (mut session, server) = started_session(5_000).await;
    let mut events = session.subscribe_events();

    assert_eq!(
        session.enable_broadcast_mode().await.unwrap(),
        BroadcastTrigger::NoClients
    );

    let late = client().await;
    late.send_to(b"START", server).await.unwrap();

    let started = wait_for_event(&mut events, |e| {
        matches!(e, RelayEvent::BroadcastStarted { .. })
    })
    .await;
    assert!(matches!(
        started,
        RelayEvent::BroadcastStarted {
            scope: BroadcastScope::Targeted,
            targets: 1,
            ..
        }
    ));

    let (sequences, payload) = receive_packets(&late, 5).await;
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    assert_eq!(payload.len(), 5_000);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejoin_does_not_restart_stream() {
    let (mut session, server) = started_session(2_000).await;
    let mut events = session.subscribe_events();
    session.enable_broadcast_mode().await.unwrap();

    let c = client().await;
    c.send_to(b"START", server).await.unwrap();
    let (sequences, _) = receive_packets(&c, 2).await;
    assert_eq!(sequences, vec![0, 1]);

    c.send_to(b"START", server).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, RelayEvent::ClientRejoined { .. })).await;

    // No second run for a known client
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let nothing = tokio::time::timeout(Duration::from_millis(200), c.recv_from(&mut buf)).await;
    assert!(nothing.is_err());

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_unregisters_client() {
    let (mut session, server) = started_session(1_000).await;
    let mut events = session.subscribe_events();

    let c = client().await;
    c.send_to(b"START", server).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, RelayEvent::ClientJoined { .. })).await;

    c.send_to(b"STOP", server).await.unwrap();
    let left = wait_for_event(&mut events, |e| matches!(e, RelayEvent::ClientLeft { .. })).await;
    assert_eq!(
        left,
        RelayEvent::ClientLeft {
            addr: c.local_addr().unwrap(),
            total: 0
        }
    );
    assert_eq!(session.registry().size().await, 0);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_datagrams_do_not_stop_listener() {
    let (mut session, server) = started_session(1_000).await;
    let mut events = session.subscribe_events();

    let c = client().await;
    c.send_to(&[0xff, 0xfe, 0xfd], server).await.unwrap();
    c.send_to(b"PAUSE", server).await.unwrap();
    c.send_to(b"START", server).await.unwrap();

    wait_for_event(&mut events, |e| matches!(e, RelayEvent::ClientJoined { .. })).await;
    assert_eq!(session.registry().size().await, 1);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_broadcast_config_enables_mode_on_start() {
    let mut config = test_config();
    config.auto_broadcast = true;
    let mut session = Session::new(test_pcm(3_000), config);
    let server = session.start().await.unwrap();
    assert!(session.is_broadcast_mode());

    let c = client().await;
    c.send_to(b"START", server).await.unwrap();
    let (sequences, _) = receive_packets(&c, 3).await;
    assert_eq!(sequences, vec![0, 1, 2]);

    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_joining_while_mode_is_enabled_is_served() {
    for _ in 0..10 {
        let (mut session, server) = started_session(2_040).await;
        let c = client().await;

        let (trigger, sent) = tokio::join!(
            session.enable_broadcast_mode(),
            c.send_to(b"START", server)
        );
        trigger.unwrap();
        sent.unwrap();

        // Served by the all-clients run, its own run, or both
        let (sequences, _) = receive_packets(&c, 2).await;
        assert_eq!(sequences[0], 0);

        session.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_aborts_runs_past_grace_period() {
    let mut config = test_config();
    config.shutdown_grace = Duration::ZERO;
    // Far more audio than loopback delivers before shutdown is called
    let pcm = PcmBuffer::from_bytes(vec![0x55u8; 128 * 1024 * 1024], PcmFormat::RELAY);
    let mut session = Session::new(pcm, config);
    let server = session.start().await.unwrap();
    let mut events = session.subscribe_events();

    let c = client().await;
    c.send_to(b"START", server).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, RelayEvent::ClientJoined { .. })).await;

    assert_eq!(
        session.enable_broadcast_mode().await.unwrap(),
        BroadcastTrigger::Started
    );
    receive_packets(&c, 1).await;

    assert!(!session.shutdown().await);
    assert_eq!(session.state(), SessionState::Stopped);

    // Only datagrams queued before shutdown returned may still be read
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let went_quiet = tokio::time::timeout(WAIT, async {
        while tokio::time::timeout(Duration::from_millis(200), c.recv_from(&mut buf))
            .await
            .is_ok()
        {}
    })
    .await;
    assert!(went_quiet.is_ok(), "datagrams kept arriving after shutdown");

    // The relay socket is closed, so its address is free again
    UdpSocket::bind(server).await.unwrap();
}

#[tokio::test]
async fn test_bind_conflict_is_fatal() {
    let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.bind_addr = occupied.local_addr().unwrap();

    let mut session = Session::new(test_pcm(1_000), config);
    let result = session.start().await;

    assert!(matches!(result, Err(Error::Bind { .. })));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_operations_require_running_session() {
    let mut session = Session::new(test_pcm(1_000), test_config());

    assert_eq!(session.state(), SessionState::Idle);
    assert!(matches!(
        session.enable_broadcast_mode().await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(session.broadcast_all(), Err(Error::InvalidState(_))));

    session.start().await.unwrap();
    session.shutdown().await;

    assert!(matches!(session.start().await, Err(Error::InvalidState(_))));
    assert!(matches!(
        session.broadcast_to(vec!["127.0.0.1:9".parse().unwrap()]),
        Err(Error::InvalidState(_))
    ));
    assert_eq!(session.local_addr(), None);
}

#[tokio::test]
async fn test_load_missing_file_fails_before_bind() {
    let result = Session::load(
        std::path::Path::new("/nonexistent/pcmcast/song.mp3"),
        test_config(),
    )
    .await;

    assert!(matches!(result, Err(Error::Decode(_))));
}
