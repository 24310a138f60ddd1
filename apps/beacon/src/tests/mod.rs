//! Whole-stack exercises: two sessions negotiating with each other over a
//! real loopback socket, mock media engines on both ends.

use std::sync::Arc;
use std::time::Duration;

use signal_transport::{Candidate, DescriptionKind, Endpoint, FrameConfig, SocketKind};

use crate::config::DEFAULT_DELIMITER;
use crate::media::MediaEngine as _;
use crate::media::mock::{MockEngine, MockEngineFactory};
use crate::negotiation::{Role, SessionPhase};
use crate::session::{Session, SessionConfig, SessionHandle};

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
    socket.local_addr().expect("local addr").port()
}

fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

fn session_config(role: Role, endpoint: Endpoint, socket: SocketKind, frame: FrameConfig) -> SessionConfig {
    SessionConfig {
        role,
        endpoint,
        socket,
        frame,
        resend_interval: Duration::from_millis(50),
        max_resend_attempts: 50,
        capture_interval: None,
    }
}

async fn wait_connected(handle: &mut SessionHandle) {
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(SessionPhase::Connected))
        .await
        .expect("session did not connect");
}

async fn wait_for_candidates(engine: &MockEngine, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let applied: Vec<String> = engine
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        if expected.iter().all(|c| applied.iter().any(|a| a == c)) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "candidates never arrived: have {applied:?}, want {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn only_engine(factory: &MockEngineFactory) -> Arc<MockEngine> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let engines = factory.created();
        if let Some(engine) = engines.first() {
            return engine.clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "engine never created");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn handshake(socket: SocketKind, frame: FrameConfig, port: u16) {
    let host_factory = Arc::new(MockEngineFactory::new("host-sdp").with_negotiation_needed());
    let join_factory = Arc::new(MockEngineFactory::new("join-sdp"));
    let endpoint = Endpoint::new("127.0.0.1", port);

    let (host, mut host_handle) = Session::new(
        session_config(Role::Offerer, endpoint.clone(), socket, frame.clone()),
        host_factory.clone(),
    );
    let (join, mut join_handle) = Session::new(
        session_config(Role::Answerer, endpoint, socket, frame),
        join_factory.clone(),
    );

    let host_run = tokio::spawn(host.run());
    // Give the host a head start so the dialer finds a bound socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let join_run = tokio::spawn(join.run());

    wait_connected(&mut host_handle).await;
    wait_connected(&mut join_handle).await;

    let host_engine = only_engine(&host_factory).await;
    let join_engine = only_engine(&join_factory).await;

    // Exactly one offer/answer round, whatever the resend cadence did.
    assert_eq!(host_engine.offers_created(), 1);
    assert_eq!(host_engine.local_applies(), 1);
    assert_eq!(host_engine.remote_applies(), 1);
    assert_eq!(
        host_engine.remote_description().map(|d| d.kind),
        Some(DescriptionKind::Answer)
    );
    assert_eq!(join_engine.answers_created(), 1);
    assert_eq!(
        join_engine.remote_description().map(|d| d.kind),
        Some(DescriptionKind::Offer)
    );
    assert_eq!(join_engine.remote_description().map(|d| d.sdp), Some("host-sdp".into()));

    // Candidates discovered after connect still relay across, both ways.
    host_engine.discover_candidate(Candidate::new("candidate:host-1"));
    host_engine.discover_candidate(Candidate::new("candidate:host-2"));
    join_engine.discover_candidate(Candidate::new("candidate:join-1"));
    join_engine.discover_candidate(Candidate::new("candidate:join-2"));
    wait_for_candidates(&join_engine, &["candidate:host-1", "candidate:host-2"]).await;
    wait_for_candidates(&host_engine, &["candidate:join-1", "candidate:join-2"]).await;

    host_handle.shutdown();
    join_handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), host_run)
        .await
        .expect("host did not stop")
        .expect("join")
        .expect("host session error");
    tokio::time::timeout(Duration::from_secs(5), join_run)
        .await
        .expect("join did not stop")
        .expect("join")
        .expect("join session error");

    assert!(host_engine.is_closed());
    assert!(join_engine.is_closed());
}

#[tokio::test]
async fn datagram_handshake_end_to_end() {
    handshake(SocketKind::Datagram, FrameConfig::default(), free_udp_port()).await;
}

#[tokio::test]
async fn stream_handshake_with_compressed_delimited_frames() {
    let frame = FrameConfig {
        delimiter: Some(DEFAULT_DELIMITER.to_string()),
        compression: true,
    };
    handshake(SocketKind::Stream, frame, free_tcp_port()).await;
}
