//! Relay side of the agent control channel
//!
//! Reads frames from one agent connection, handles registration, and routes
//! session-scoped messages into the session table. Any inbound frame refreshes
//! the agent's liveness; a connection that stays silent for the liveness
//! window is dropped.

use crate::broker::{CloseReason, ConnectionBroker};
use crate::connection::AgentChannel;
use crate::session_table::{ClientSignal, SessionMode};
use futures::StreamExt;
use sshgate_proto::{ControlCodec, ControlMessage, Direction, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Result of routing one inbound agent message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handed to the session it belongs to
    Delivered,
    /// Must be answered on the same channel
    Reply(ControlMessage),
    /// Valid but not applicable in the current state
    Ignored,
    /// Referenced a session that does not exist (or not on this agent)
    UnknownSession(SessionId),
}

impl ConnectionBroker {
    /// Serve one agent control connection until it closes
    pub async fn handle_agent_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, ControlCodec::new());
        let (channel, rx) = AgentChannel::new(peer_addr);
        let writer = channel.spawn_writer(FramedWrite::new(write_half, ControlCodec::new()), rx);
        let window = self.config.liveness_window;

        debug!(peer = %peer_addr, channel_id = channel.id(), "Agent control connection opened");

        let mut registered: Option<String> = None;

        loop {
            let next = tokio::select! {
                _ = channel.closed() => {
                    debug!(channel_id = channel.id(), "Control channel closed locally");
                    break;
                }
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(window, reader.next()) => next,
            };

            let msg = match next {
                Err(_) => {
                    warn!(
                        peer = %peer_addr,
                        agent_id = registered.as_deref().unwrap_or("-"),
                        "No control traffic for {:?}, dropping agent",
                        window
                    );
                    break;
                }
                Ok(None) => {
                    info!(peer = %peer_addr, agent_id = registered.as_deref().unwrap_or("-"), "Agent disconnected");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(peer = %peer_addr, "Failed to read control message: {}", e);
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                ControlMessage::RegisterAgent {
                    agent_id,
                    auth_token,
                    ssh_port,
                } => {
                    // One channel serves one agent id; re-registering that id replaces it
                    let other = registered
                        .as_deref()
                        .filter(|current| *current != agent_id)
                        .map(str::to_string);

                    let reply = if let Some(current) = other {
                        warn!(
                            agent_id = %current,
                            requested = %agent_id,
                            "Rejecting registration of a different agent on this channel"
                        );
                        ControlMessage::registration_rejected(format!(
                            "Channel already registered as {}",
                            current
                        ))
                    } else {
                        let nat = self.classifier.classify(peer_addr);
                        match self
                            .register_agent(&agent_id, &auth_token, ssh_port, nat.clone(), channel.clone())
                            .await
                        {
                            Ok(_) => {
                                registered = Some(agent_id);
                                ControlMessage::registration_accepted(nat)
                            }
                            // The channel stays open so the agent may try again
                            Err(e) => ControlMessage::registration_rejected(e.to_string()),
                        }
                    };
                    if channel.send(reply).await.is_err() {
                        break;
                    }
                }
                msg => {
                    let Some(agent_id) = registered.as_deref() else {
                        if let ControlMessage::Ping { timestamp } = msg {
                            if channel.send(ControlMessage::Pong { timestamp }).await.is_err() {
                                break;
                            }
                        } else {
                            debug!(peer = %peer_addr, kind = msg.kind(), "Ignoring message before registration");
                        }
                        continue;
                    };

                    self.touch_agent(agent_id, channel.id());
                    let kind = msg.kind();
                    match self.dispatch(agent_id, channel.id(), msg) {
                        DispatchOutcome::Reply(reply) => {
                            if channel.send(reply).await.is_err() {
                                break;
                            }
                        }
                        DispatchOutcome::UnknownSession(session_id) => {
                            debug!(agent_id = %agent_id, session_id = %session_id, kind, "Dropping message for unknown session");
                        }
                        DispatchOutcome::Ignored => {
                            debug!(agent_id = %agent_id, kind, "Ignored control message");
                        }
                        DispatchOutcome::Delivered => {}
                    }
                }
            }
        }

        if let Some(agent_id) = registered {
            let closed = self.remove_agent(&agent_id, channel.id());
            info!(agent_id = %agent_id, sessions_closed = closed, "Agent control channel cleaned up");
        }

        channel.close();
        let _ = writer.await;
    }

    /// Route one message from a registered agent
    ///
    /// `channel_id` must be the channel the message arrived on; sessions that
    /// belong to another registration are treated as unknown.
    pub fn dispatch(&self, agent_id: &str, channel_id: u64, msg: ControlMessage) -> DispatchOutcome {
        match msg {
            ControlMessage::SshData {
                session_id,
                direction: Direction::ServerToClient,
                data,
            } => {
                let tables = self.lock();
                let Some(entry) = tables.sessions.get(&session_id) else {
                    return DispatchOutcome::UnknownSession(session_id);
                };
                if !entry.is_owned_by(agent_id, channel_id) {
                    return DispatchOutcome::UnknownSession(session_id);
                }
                if entry.mode != SessionMode::Relayed {
                    debug!(session_id = %session_id, mode = %entry.mode, "Dropping data for session not in relay mode");
                    return DispatchOutcome::Ignored;
                }
                let sent = entry.to_client.try_send(ClientSignal::Data(data));
                drop(tables);

                match sent {
                    Ok(()) => DispatchOutcome::Delivered,
                    Err(TrySendError::Closed(_)) => DispatchOutcome::Ignored,
                    Err(TrySendError::Full(_)) => {
                        warn!(session_id = %session_id, "Client is not keeping up, closing session");
                        self.close_session(&session_id, CloseReason::ClientTooSlow);
                        DispatchOutcome::Ignored
                    }
                }
            }
            ControlMessage::SshData {
                session_id,
                direction: Direction::ClientToServer,
                ..
            } => {
                warn!(agent_id = %agent_id, session_id = %session_id, "Agent sent client-to-server data");
                DispatchOutcome::Ignored
            }
            ControlMessage::SshClose { session_id, reason } => {
                let relayed = {
                    let tables = self.lock();
                    match tables.sessions.get(&session_id) {
                        Some(entry) if entry.is_owned_by(agent_id, channel_id) => {
                            if entry.mode == SessionMode::Relayed {
                                // Let the client task flush queued data before it closes
                                Some(entry.to_client.try_send(ClientSignal::Close(reason.clone())).is_ok())
                            } else {
                                Some(false)
                            }
                        }
                        _ => None,
                    }
                };

                match relayed {
                    None => DispatchOutcome::UnknownSession(session_id),
                    Some(true) => DispatchOutcome::Delivered,
                    Some(false) => {
                        self.close_session(&session_id, CloseReason::AgentClosed(reason));
                        DispatchOutcome::Delivered
                    }
                }
            }
            ControlMessage::Ping { timestamp } => DispatchOutcome::Reply(ControlMessage::Pong { timestamp }),
            ControlMessage::Pong { .. } | ControlMessage::P2pResult { .. } => DispatchOutcome::Ignored,
            ControlMessage::RegisterAgent { .. }
            | ControlMessage::RegistrationResult { .. }
            | ControlMessage::NewSshConnection { .. } => {
                warn!(agent_id = %agent_id, kind = msg.kind(), "Unexpected message from agent");
                DispatchOutcome::Ignored
            }
        }
    }
}
