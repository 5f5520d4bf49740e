//! Shared helpers for broker integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use sshgate_auth::SharedSecretVerifier;
use sshgate_control::{
    AddressClassifier, BrokerConfig, BrokerError, ConnectionBroker, SessionSummary,
};
use sshgate_proto::{ControlCodec, ControlMessage, Direction, NatDescriptor, ReachabilityClass};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub const TOKEN: &str = "transparent-ssh-secret-2024";
pub const STEP: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sshgate_control=debug")
        .try_init();
}

pub fn broker(config: BrokerConfig) -> ConnectionBroker {
    ConnectionBroker::new(config, Arc::new(SharedSecretVerifier::new(TOKEN)))
}

pub fn relay_only() -> BrokerConfig {
    BrokerConfig {
        direct_path_enabled: false,
        ..Default::default()
    }
}

/// Classifier that labels every peer the same way
pub struct FixedClassifier(pub ReachabilityClass);

impl AddressClassifier for FixedClassifier {
    fn classify(&self, peer_addr: SocketAddr) -> NatDescriptor {
        NatDescriptor::new(self.0, Some(peer_addr.ip().to_string()))
    }
}

pub fn peer(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], port))
}

/// In-memory agent speaking the control protocol over a duplex pipe
pub struct FakeAgent {
    outbound: mpsc::UnboundedSender<ControlMessage>,
    pub inbound: mpsc::UnboundedReceiver<ControlMessage>,
    task: JoinHandle<()>,
    pub relay_task: JoinHandle<()>,
}

impl FakeAgent {
    /// Attach a fake agent to the broker; when `echo` is set every
    /// client-to-server chunk is mirrored back as server-to-client
    pub fn attach(broker: &Arc<ConnectionBroker>, peer_addr: SocketAddr, echo: bool) -> Self {
        let (agent_side, relay_side) = tokio::io::duplex(256 * 1024);
        let relay_task = tokio::spawn(broker.clone().handle_agent_connection(relay_side, peer_addr));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let mut framed = Framed::new(agent_side, ControlCodec::new());

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = outbound_rx.recv() => match out {
                        Some(msg) => {
                            if framed.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = framed.next() => {
                        let Some(Ok(msg)) = msg else { break };
                        if echo {
                            if let ControlMessage::SshData {
                                session_id,
                                direction: Direction::ClientToServer,
                                data,
                            } = &msg
                            {
                                let reply = ControlMessage::session_data(
                                    *session_id,
                                    Direction::ServerToClient,
                                    data.clone(),
                                );
                                if framed.send(reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        let _ = inbound_tx.send(msg);
                    }
                }
            }
        });

        Self {
            outbound,
            inbound,
            task,
            relay_task,
        }
    }

    /// Attach and register, asserting the registration succeeds
    pub async fn register(
        broker: &Arc<ConnectionBroker>,
        agent_id: &str,
        peer_addr: SocketAddr,
        echo: bool,
    ) -> Self {
        let mut agent = Self::attach(broker, peer_addr, echo);
        let result = agent.register_with(agent_id, TOKEN).await;
        assert!(
            matches!(result, ControlMessage::RegistrationResult { success: true, .. }),
            "registration failed: {:?}",
            result
        );
        agent
    }

    pub async fn register_with(&mut self, agent_id: &str, token: &str) -> ControlMessage {
        self.send(ControlMessage::RegisterAgent {
            agent_id: agent_id.to_string(),
            auth_token: token.to_string(),
            ssh_port: 22,
        });
        self.recv_matching(|m| matches!(m, ControlMessage::RegistrationResult { .. }))
            .await
    }

    pub fn send(&self, msg: ControlMessage) {
        let _ = self.outbound.send(msg);
    }

    /// Wait for the next inbound message matching `pred`, skipping others
    pub async fn recv_matching<F>(&mut self, pred: F) -> ControlMessage
    where
        F: Fn(&ControlMessage) -> bool,
    {
        timeout(STEP, async {
            loop {
                match self.inbound.recv().await {
                    Some(msg) if pred(&msg) => return msg,
                    Some(_) => continue,
                    None => panic!("fake agent connection closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for control message")
    }

    /// Everything received so far
    pub fn drain(&mut self) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.inbound.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Drop the connection as if the agent process died
    pub async fn disconnect(self) {
        self.task.abort();
        let _ = self.task.await;
        let _ = timeout(STEP, self.relay_task).await;
    }
}

pub type ClientHandle = JoinHandle<Result<SessionSummary, BrokerError>>;

/// Open an in-memory client connection through the broker
pub fn open_client(broker: &Arc<ConnectionBroker>, peer_addr: SocketAddr) -> (DuplexStream, ClientHandle) {
    let (client, relay_side) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(broker.clone().handle_client(relay_side, peer_addr));
    (client, handle)
}

/// Poll until `cond` holds or the step timeout elapses
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    timeout(STEP, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
