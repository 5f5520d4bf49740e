//! Integration tests for relayed and direct session lifecycles

mod common;

use async_trait::async_trait;
use common::*;
use sshgate_control::{
    BrokerConfig, BrokerError, CloseReason, DirectPathAttempt, DirectPathError, DirectTarget,
    SessionMode, MAX_PENDING_BYTES,
};
use sshgate_proto::{ControlMessage, NatDescriptor, ReachabilityClass};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

const BANNER: &[u8] = b"SSH-2.0-OpenSSH_8.9\r\n";

fn loopback_client(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Direct-path stub that never answers
struct HangingDirectPath {
    calls: AtomicUsize,
}

#[async_trait]
impl DirectPathAttempt for HangingDirectPath {
    async fn attempt(
        &self,
        _client: &NatDescriptor,
        _agent: &NatDescriptor,
        _target: &DirectTarget,
    ) -> Result<SocketAddr, DirectPathError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Direct-path stub that always points at a fixed endpoint
struct FixedEndpoint(SocketAddr);

#[async_trait]
impl DirectPathAttempt for FixedEndpoint {
    async fn attempt(
        &self,
        _client: &NatDescriptor,
        _agent: &NatDescriptor,
        _target: &DirectTarget,
    ) -> Result<SocketAddr, DirectPathError> {
        Ok(self.0)
    }
}

async fn read_exact_with_timeout(client: &mut tokio::io::DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(STEP, client.read_exact(&mut buf))
        .await
        .expect("timed out reading from client")
        .expect("client read failed");
    buf
}

#[tokio::test]
async fn test_no_agent_closes_client_without_session() {
    init_tracing();
    let broker = Arc::new(broker(relay_only()));

    let (mut client, handle) = open_client(&broker, loopback_client(50000));
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(BrokerError::NoAgentAvailable)));
    assert_eq!(broker.session_count(), 0);

    // The relay side was dropped, so the client sees EOF
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_sessions_get_distinct_ids_and_clean_up() {
    init_tracing();
    let broker = Arc::new(broker(relay_only()));
    let _agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), true).await;

    const N: usize = 20;
    let mut clients = Vec::new();
    for i in 0..N {
        clients.push(open_client(&broker, loopback_client(50000 + i as u16)));
    }

    for (i, (client, _)) in clients.iter_mut().enumerate() {
        let payload = format!("payload-{:02}", i);
        client.write_all(payload.as_bytes()).await.unwrap();
        let echoed = read_exact_with_timeout(client, payload.len()).await;
        assert_eq!(echoed, payload.as_bytes());
    }

    assert_eq!(broker.session_count(), N);
    assert!(broker.max_concurrent_sessions() <= N);

    let mut ids = HashSet::new();
    for (client, handle) in clients {
        drop(client);
        let summary = timeout(STEP, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(summary.final_mode, SessionMode::Relayed);
        assert_eq!(summary.close_reason, Some(CloseReason::ClientClosed));
        ids.insert(summary.session_id);
    }

    assert_eq!(ids.len(), N);
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.agent_session_count("agent1"), 0);
}

#[tokio::test]
async fn test_banner_arrives_exactly_once() {
    init_tracing();
    let broker = Arc::new(broker(relay_only()));
    let mut agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), false).await;

    let (mut client, handle) = open_client(&broker, loopback_client(50001));
    let announced = agent
        .recv_matching(|m| matches!(m, ControlMessage::NewSshConnection { .. }))
        .await;
    let session_id = announced.session_id().unwrap();

    agent.send(ControlMessage::session_data(
        session_id,
        sshgate_proto::Direction::ServerToClient,
        BANNER.to_vec(),
    ));
    agent.send(ControlMessage::session_close(session_id, Some("backend closed".into())));

    let mut received = Vec::new();
    timeout(STEP, client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, BANNER);

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(
        summary.close_reason,
        Some(CloseReason::AgentClosed(Some("backend closed".to_string())))
    );
    assert_eq!(summary.bytes_to_client, BANNER.len() as u64);
}

#[tokio::test]
async fn test_symmetric_pair_goes_straight_to_relay() {
    init_tracing();
    let direct = Arc::new(HangingDirectPath {
        calls: AtomicUsize::new(0),
    });
    let broker = Arc::new(
        broker(BrokerConfig::default())
            .with_classifier(Arc::new(FixedClassifier(ReachabilityClass::Symmetric)))
            .with_direct_path(direct.clone()),
    );
    let mut agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), true).await;

    let (mut client, handle) = open_client(&broker, peer(9, 50002));
    agent
        .recv_matching(|m| matches!(m, ControlMessage::NewSshConnection { .. }))
        .await;

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_with_timeout(&mut client, 4).await, b"ping");

    drop(client);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.final_mode, SessionMode::Relayed);
    assert_eq!(direct.calls.load(Ordering::SeqCst), 0);

    // No p2p-result either, since no attempt was made
    assert!(!agent
        .drain()
        .iter()
        .any(|m| matches!(m, ControlMessage::P2pResult { .. })));
}

#[tokio::test]
async fn test_hanging_direct_attempt_falls_back_with_buffered_bytes() {
    init_tracing();
    let direct = Arc::new(HangingDirectPath {
        calls: AtomicUsize::new(0),
    });
    let config = BrokerConfig {
        direct_attempt_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let broker = Arc::new(
        broker(config)
            .with_classifier(Arc::new(FixedClassifier(ReachabilityClass::Cone)))
            .with_direct_path(direct.clone()),
    );
    let mut agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), true).await;

    const SESSIONS: usize = 5;
    let mut clients = Vec::new();
    for i in 0..SESSIONS {
        let (mut client, handle) = open_client(&broker, peer(9, 51000 + i as u16));
        // Sent while the direct attempt is still in flight
        client.write_all(BANNER).await.unwrap();
        clients.push((client, handle));
    }

    for (client, _) in clients.iter_mut() {
        assert_eq!(read_exact_with_timeout(client, BANNER.len()).await, BANNER);
    }
    assert_eq!(direct.calls.load(Ordering::SeqCst), SESSIONS);

    for (client, handle) in clients {
        drop(client);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.final_mode, SessionMode::Relayed);
        assert_eq!(summary.bytes_from_client, BANNER.len() as u64);
        assert_eq!(summary.bytes_to_client, BANNER.len() as u64);
    }

    let failures = agent
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ControlMessage::P2pResult { success: false, .. }))
        .count();
    assert_eq!(failures, SESSIONS);
}

#[tokio::test]
async fn test_full_pending_buffer_ends_direct_attempt_early() {
    init_tracing();
    let direct = Arc::new(HangingDirectPath {
        calls: AtomicUsize::new(0),
    });
    let config = BrokerConfig {
        // Far longer than the test is allowed to run
        direct_attempt_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let broker = Arc::new(
        broker(config)
            .with_classifier(Arc::new(FixedClassifier(ReachabilityClass::Cone)))
            .with_direct_path(direct.clone()),
    );
    let mut agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), false).await;

    let (mut client, handle) = open_client(&broker, peer(9, 52000));
    let payload = vec![7u8; MAX_PENDING_BYTES];
    timeout(STEP, client.write_all(&payload)).await.unwrap().unwrap();

    let failure = agent
        .recv_matching(|m| matches!(m, ControlMessage::P2pResult { .. }))
        .await;
    match failure {
        ControlMessage::P2pResult { success, reason, .. } => {
            assert!(!success);
            assert_eq!(reason.as_deref(), Some("client buffer limit reached"));
        }
        other => panic!("Expected P2pResult, got {:?}", other),
    }

    let mut relayed = 0;
    while relayed < MAX_PENDING_BYTES {
        match agent
            .recv_matching(|m| matches!(m, ControlMessage::SshData { .. }))
            .await
        {
            ControlMessage::SshData { data, .. } => relayed += data.len(),
            other => panic!("Expected SshData, got {:?}", other),
        }
    }
    assert_eq!(relayed, MAX_PENDING_BYTES);

    // Closing the client is noticed right away, not after the attempt timeout
    drop(client);
    let summary = timeout(STEP, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.final_mode, SessionMode::Relayed);
    assert_eq!(summary.bytes_from_client, MAX_PENDING_BYTES as u64);
    assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_direct_path_carries_bytes_without_agent() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => socket.write_all(&buf[..n]).await.unwrap(),
            }
        }
    });

    let broker = Arc::new(
        broker(BrokerConfig::default())
            .with_classifier(Arc::new(FixedClassifier(ReachabilityClass::Cone)))
            .with_direct_path(Arc::new(FixedEndpoint(endpoint))),
    );
    let mut agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), true).await;

    let (mut client, handle) = open_client(&broker, peer(9, 52000));
    client.write_all(BANNER).await.unwrap();
    assert_eq!(read_exact_with_timeout(&mut client, BANNER.len()).await, BANNER);

    let result = agent
        .recv_matching(|m| matches!(m, ControlMessage::P2pResult { .. }))
        .await;
    assert!(matches!(result, ControlMessage::P2pResult { success: true, .. }));

    drop(client);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.final_mode, SessionMode::Direct);
    assert_eq!(summary.direct_endpoint, Some(endpoint));

    // The agent never heard about the session as a relayed one
    assert!(!agent
        .drain()
        .iter()
        .any(|m| matches!(m, ControlMessage::NewSshConnection { .. } | ControlMessage::SshData { .. })));
}

#[tokio::test]
async fn test_direct_path_dropped_before_data_falls_back() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Accept and hang up immediately
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let broker = Arc::new(
        broker(BrokerConfig::default())
            .with_classifier(Arc::new(FixedClassifier(ReachabilityClass::Cone)))
            .with_direct_path(Arc::new(FixedEndpoint(endpoint))),
    );
    let _agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), true).await;

    let (mut client, handle) = open_client(&broker, peer(9, 52001));
    // Give the direct connection time to die before sending anything
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(b"after-fallback").await.unwrap();
    assert_eq!(
        read_exact_with_timeout(&mut client, 14).await,
        b"after-fallback"
    );

    drop(client);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.final_mode, SessionMode::Relayed);
}

#[tokio::test]
async fn test_simultaneous_close_triggers_clean_up_once() {
    init_tracing();
    let broker = Arc::new(broker(relay_only()));
    let mut agent = FakeAgent::register(&broker, "agent1", peer(2, 40000), false).await;

    let (client, handle) = open_client(&broker, loopback_client(50003));
    let announced = agent
        .recv_matching(|m| matches!(m, ControlMessage::NewSshConnection { .. }))
        .await;
    let session_id = announced.session_id().unwrap();

    let mut closers = Vec::new();
    for _ in 0..8 {
        let broker = broker.clone();
        closers.push(tokio::spawn(async move {
            broker.close_session(&session_id, CloseReason::ClientClosed)
        }));
    }
    agent.send(ControlMessage::session_close(session_id, None));
    drop(client);

    let mut performed = 0;
    for closer in closers {
        if closer.await.unwrap() {
            performed += 1;
        }
    }
    let summary = handle.await.unwrap().unwrap();
    if summary.close_reason.is_some() {
        performed += 1;
    }
    assert_eq!(performed, 1);
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.agent_session_count("agent1"), 0);

    // At most one ssh-close comes back for the session
    tokio::time::sleep(Duration::from_millis(100)).await;
    let closes = agent
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ControlMessage::SshClose { .. }))
        .count();
    assert!(closes <= 1);
}
