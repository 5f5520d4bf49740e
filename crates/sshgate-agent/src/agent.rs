//! Agent control loop: connect, register, serve sessions, reconnect

use crate::config::AgentConfig;
use crate::forwarder::{BackendForwarder, SessionHandle};
use crate::reconnect::{ReconnectError, ReconnectManager};
use futures::{SinkExt, StreamExt};
use sshgate_proto::{CodecError, ControlCodec, ControlMessage, Direction, SessionId};
use std::collections::HashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outbound queue depth for the control channel
const OUTBOUND_QUEUE_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to relay {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out {0}")]
    Timeout(&'static str),

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Unexpected message during handshake: {0}")]
    UnexpectedMessage(&'static str),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Control connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

impl AgentError {
    /// Errors that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::RegistrationRejected(_) | AgentError::Reconnect(_))
    }
}

type ControlFramed = Framed<TcpStream, ControlCodec>;

/// Private-network agent
pub struct Agent {
    config: AgentConfig,
    forwarder: BackendForwarder,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let forwarder = BackendForwarder::new(config.backend_addr(), config.connect_timeout);
        Self {
            config,
            forwarder,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Token that stops [`Agent::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown, a rejected registration, or exhausted reconnects
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            match self.run_once(&mut reconnect).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(agent_id = %self.config.agent_id, "❌ {}", e);
                    return Err(e);
                }
                Err(e) => warn!(agent_id = %self.config.agent_id, "Control connection lost: {}", e),
            }

            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            info!("🔄 Reconnecting to relay (attempt {})...", reconnect.attempt() + 1);
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                res = reconnect.wait() => res?,
            }
        }
    }

    /// One connection lifetime: dial, register, serve
    async fn run_once(&self, reconnect: &mut ReconnectManager) -> Result<(), AgentError> {
        let framed = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            res = self.connect_and_register() => res?,
        };

        reconnect.reset();
        self.serve(framed).await
    }

    async fn connect_and_register(&self) -> Result<ControlFramed, AgentError> {
        let address = self.config.relay_addr.clone();
        let limit = self.config.connect_timeout;

        info!(relay = %address, agent_id = %self.config.agent_id, "Connecting to relay");

        let stream = tokio::time::timeout(limit, TcpStream::connect(&address))
            .await
            .map_err(|_| AgentError::Timeout("connecting to relay"))?
            .map_err(|source| AgentError::Connect {
                address: address.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, ControlCodec::new());
        framed
            .send(ControlMessage::RegisterAgent {
                agent_id: self.config.agent_id.clone(),
                auth_token: self.config.auth_token.clone(),
                ssh_port: self.config.ssh_port,
            })
            .await?;

        let reply = tokio::time::timeout(limit, framed.next())
            .await
            .map_err(|_| AgentError::Timeout("waiting for registration result"))?
            .ok_or(AgentError::ConnectionClosed)??;

        match reply {
            ControlMessage::RegistrationResult {
                success: true,
                nat_info,
                ..
            } => {
                let nat = nat_info
                    .map(|n| n.reachability_class.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                info!(
                    agent_id = %self.config.agent_id,
                    relay = %address,
                    nat = %nat,
                    "✅ Registered with relay"
                );
                Ok(framed)
            }
            ControlMessage::RegistrationResult { error, .. } => Err(AgentError::RegistrationRejected(
                error.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(AgentError::UnexpectedMessage(other.kind())),
        }
    }

    /// Serve a registered control connection until it drops or shutdown
    async fn serve(&self, framed: ControlFramed) -> Result<(), AgentError> {
        let (mut sink, mut stream) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE_SIZE);
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<SessionId>();

        let mut writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                sink.send(msg).await?;
            }
            let _ = sink.close().await;
            Ok::<(), CodecError>(())
        });

        let mut sessions: HashMap<SessionId, SessionHandle> = HashMap::new();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = heartbeat.tick() => {
                    let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    if outbound.send(ControlMessage::Ping { timestamp }).await.is_err() {
                        break Err(AgentError::ConnectionClosed);
                    }
                }
                Some(session_id) = finished_rx.recv() => {
                    sessions.remove(&session_id);
                }
                res = &mut writer => {
                    break match res {
                        Ok(Err(e)) => Err(e.into()),
                        _ => Err(AgentError::ConnectionClosed),
                    };
                }
                msg = stream.next() => match msg {
                    None => break Err(AgentError::ConnectionClosed),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(msg)) => self.handle_message(msg, &mut sessions, &outbound, &finished_tx),
                },
            }
        };

        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "Aborting backend sessions");
        }
        for (_, handle) in sessions.drain() {
            handle.abort();
        }
        writer.abort();

        result
    }

    fn handle_message(
        &self,
        msg: ControlMessage,
        sessions: &mut HashMap<SessionId, SessionHandle>,
        outbound: &mpsc::Sender<ControlMessage>,
        finished: &mpsc::UnboundedSender<SessionId>,
    ) {
        match msg {
            ControlMessage::NewSshConnection {
                session_id,
                client_info,
            } => {
                if sessions.contains_key(&session_id) {
                    warn!(session_id = %session_id, "Duplicate session announcement ignored");
                    return;
                }
                info!(
                    session_id = %session_id,
                    client = %format!("{}:{}", client_info.address, client_info.port),
                    backend = %self.forwarder.backend_addr(),
                    "New relayed session"
                );
                let handle = self
                    .forwarder
                    .spawn(session_id, outbound.clone(), finished.clone());
                sessions.insert(session_id, handle);
            }
            ControlMessage::SshData {
                session_id,
                direction: Direction::ClientToServer,
                data,
            } => match sessions.get(&session_id) {
                Some(handle) => {
                    handle.send_data(data);
                }
                None => debug!(session_id = %session_id, "Data for unknown session dropped"),
            },
            ControlMessage::SshClose { session_id, reason } => {
                if let Some(handle) = sessions.remove(&session_id) {
                    debug!(session_id = %session_id, reason = ?reason, "Relay closed session");
                    handle.close();
                }
            }
            ControlMessage::P2pResult {
                session_id,
                success,
                endpoint,
                reason,
            } => {
                debug!(
                    session_id = %session_id,
                    success,
                    endpoint = ?endpoint,
                    reason = ?reason,
                    "Direct path result"
                );
            }
            ControlMessage::Ping { timestamp } => {
                if outbound.try_send(ControlMessage::Pong { timestamp }).is_err() {
                    debug!("Outbound queue full, pong skipped");
                }
            }
            ControlMessage::Pong { .. } => {}
            other => warn!(kind = other.kind(), "Unexpected message from relay"),
        }
    }
}
