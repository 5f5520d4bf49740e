//! Per-client session driver
//!
//! One task per accepted client connection walks the session through
//! `Pending -> [DirectAttempt -> Direct] -> Relayed -> Closed`. Direct-path
//! failures never reach the client: they fall back to relay. Bytes the client
//! sends while a direct attempt is in flight are held in a pending buffer and
//! go out first on whichever path wins.

use crate::broker::{BrokerError, CloseReason, ConnectionBroker, OpenedSession};
use crate::connection::AgentChannel;
use crate::direct_path::{DirectPathError, DirectTarget};
use crate::nat::can_attempt_direct;
use crate::session_table::{ClientSignal, SessionMode};
use bytes::BytesMut;
use sshgate_proto::{ControlMessage, Direction, NatDescriptor, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client bytes held back while a direct attempt is in flight; reaching it
/// ends the attempt
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// What happened to a client connection
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub agent_id: String,
    /// Last mode the session was in before closing
    pub final_mode: SessionMode,
    pub direct_endpoint: Option<SocketAddr>,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
    /// Set when this task performed the close; `None` when another party
    /// (agent loss, replacement, shutdown) closed the session first
    pub close_reason: Option<CloseReason>,
}

/// Closes the session if the driver exits without doing so
struct SessionGuard {
    broker: Arc<ConnectionBroker>,
    session_id: SessionId,
    armed: bool,
}

impl SessionGuard {
    fn close(mut self, reason: CloseReason) -> Option<CloseReason> {
        self.armed = false;
        self.broker
            .close_session(&self.session_id, reason.clone())
            .then_some(reason)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.broker
                .close_session(&self.session_id, CloseReason::ClientClosed);
        }
    }
}

enum DirectOutcome {
    Connected(TcpStream, SocketAddr),
    Failed(DirectPathError),
    /// The client sent more than can be held back; relay instead
    Abandoned(String),
    ClientGone,
    Cancelled,
}

enum PathEnd {
    /// Session is over
    Closed(CloseReason),
    /// Direct path died before any byte moved; fall back to relay
    Fallback(String),
    /// Someone else closed the session
    Cancelled,
}

#[derive(Default)]
struct Counters {
    from_client: u64,
    to_client: u64,
}

impl ConnectionBroker {
    /// Drive one client connection until it closes
    ///
    /// Returns [`BrokerError::NoAgentAvailable`] without creating a session
    /// when no live agent exists; the caller drops the client.
    pub async fn handle_client<S>(
        self: Arc<Self>,
        mut client: S,
        client_peer: SocketAddr,
    ) -> Result<SessionSummary, BrokerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let OpenedSession {
            session_id,
            agent,
            cancel,
            mut signals,
        } = self.open_session(client_peer)?;

        let guard = SessionGuard {
            broker: self.clone(),
            session_id,
            armed: true,
        };

        info!(
            session_id = %session_id,
            agent_id = %agent.agent_id,
            client = %client_peer,
            "New client session"
        );

        let mut summary = SessionSummary {
            session_id,
            agent_id: agent.agent_id.clone(),
            final_mode: SessionMode::Pending,
            direct_endpoint: None,
            bytes_from_client: 0,
            bytes_to_client: 0,
            close_reason: None,
        };
        let mut counters = Counters::default();
        let mut pending = BytesMut::new();

        let client_nat = self.classifier.classify(client_peer);
        let try_direct =
            agent.capable_of_direct_path && can_attempt_direct(&client_nat, &agent.nat);

        let end = if try_direct {
            self.transition(&session_id, SessionMode::DirectAttempt)?;
            summary.final_mode = SessionMode::DirectAttempt;

            let target = DirectTarget {
                agent_id: agent.agent_id.clone(),
                declared_listen_port: agent.declared_listen_port,
                client_peer,
            };

            match self
                .attempt_direct(&client_nat, &agent.nat, &target, &mut client, &mut pending, &cancel)
                .await
            {
                DirectOutcome::Connected(stream, endpoint) => {
                    self.transition(&session_id, SessionMode::Direct)?;
                    self.lock()
                        .sessions
                        .set_direct_endpoint(&session_id, Some(endpoint));
                    summary.final_mode = SessionMode::Direct;
                    summary.direct_endpoint = Some(endpoint);

                    agent.channel.notify(ControlMessage::P2pResult {
                        session_id,
                        success: true,
                        endpoint: Some(endpoint.to_string()),
                        reason: None,
                    });
                    info!(session_id = %session_id, %endpoint, "🔗 Direct path established");

                    self.pump_direct(&mut client, stream, &mut pending, &mut counters, &cancel)
                        .await
                }
                DirectOutcome::Failed(e) => {
                    debug!(session_id = %session_id, "Direct path failed: {}", e);
                    PathEnd::Fallback(e.to_string())
                }
                DirectOutcome::Abandoned(reason) => {
                    debug!(session_id = %session_id, "Direct path abandoned: {}", reason);
                    PathEnd::Fallback(reason)
                }
                DirectOutcome::ClientGone => PathEnd::Closed(CloseReason::ClientClosed),
                DirectOutcome::Cancelled => PathEnd::Cancelled,
            }
        } else {
            debug!(
                session_id = %session_id,
                client_nat = %client_nat.reachability_class,
                agent_nat = %agent.nat.reachability_class,
                direct_capable = agent.capable_of_direct_path,
                "Skipping direct path"
            );
            PathEnd::Fallback(String::new())
        };

        let end = match end {
            PathEnd::Fallback(reason) => {
                if try_direct {
                    agent.channel.notify(ControlMessage::P2pResult {
                        session_id,
                        success: false,
                        endpoint: None,
                        reason: Some(reason),
                    });
                }

                match self.transition(&session_id, SessionMode::Relayed) {
                    Ok(_) => {
                        summary.final_mode = SessionMode::Relayed;
                        self.lock().sessions.set_direct_endpoint(&session_id, None);
                        self.relay(
                            &agent.channel,
                            session_id,
                            client_peer,
                            &mut client,
                            pending,
                            &mut signals,
                            &mut counters,
                            &cancel,
                        )
                        .await
                    }
                    // Closed by someone else in the meantime
                    Err(_) if cancel.is_cancelled() => PathEnd::Cancelled,
                    Err(e) => {
                        warn!(session_id = %session_id, "Cannot fall back to relay: {}", e);
                        PathEnd::Closed(CloseReason::SetupFailed(e.to_string()))
                    }
                }
            }
            other => other,
        };

        summary.bytes_from_client = counters.from_client;
        summary.bytes_to_client = counters.to_client;
        summary.close_reason = match end {
            PathEnd::Closed(reason) => guard.close(reason),
            PathEnd::Fallback(reason) => guard.close(CloseReason::SetupFailed(reason)),
            PathEnd::Cancelled => guard.close(CloseReason::ClientClosed),
        };

        let _ = client.shutdown().await;
        Ok(summary)
    }

    /// Run the direct-path attempt and the follow-up connect under the
    /// configured timeout, buffering client bytes meanwhile
    async fn attempt_direct<S>(
        &self,
        client_nat: &NatDescriptor,
        agent_nat: &NatDescriptor,
        target: &DirectTarget,
        client: &mut S,
        pending: &mut BytesMut,
        cancel: &CancellationToken,
    ) -> DirectOutcome
    where
        S: AsyncRead + Unpin,
    {
        let limit = self.config.direct_attempt_timeout;
        let direct = async {
            let endpoint = bounded(limit, self.direct_path.attempt(client_nat, agent_nat, target))
                .await??;
            let stream = bounded(limit, TcpStream::connect(endpoint))
                .await?
                .map_err(|e| DirectPathError::Unreachable {
                    address: endpoint,
                    reason: e.to_string(),
                })?;
            Ok::<_, DirectPathError>((stream, endpoint))
        };
        tokio::pin!(direct);

        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return DirectOutcome::Cancelled,
                res = &mut direct => {
                    return match res {
                        Ok((stream, endpoint)) => DirectOutcome::Connected(stream, endpoint),
                        Err(e) => DirectOutcome::Failed(e),
                    };
                }
                read = client.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return DirectOutcome::ClientGone,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        if pending.len() >= MAX_PENDING_BYTES {
                            return DirectOutcome::Abandoned("client buffer limit reached".to_string());
                        }
                    }
                },
            }
        }
    }

    /// Copy bytes between client and the direct connection
    ///
    /// Falls back when the direct connection fails before any byte moved in
    /// either direction; after that a failure ends the session.
    async fn pump_direct<S>(
        &self,
        client: &mut S,
        mut direct: TcpStream,
        pending: &mut BytesMut,
        counters: &mut Counters,
        cancel: &CancellationToken,
    ) -> PathEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut direct_read, mut direct_write) = direct.split();

        if !pending.is_empty() {
            if let Err(e) = direct_write.write_all(pending).await {
                return PathEnd::Fallback(e.to_string());
            }
            counters.from_client += pending.len() as u64;
            pending.clear();
        }

        let mut client_buf = vec![0u8; self.config.read_buffer_size];
        let mut direct_buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let untouched = counters.from_client == 0 && counters.to_client == 0;

            tokio::select! {
                _ = cancel.cancelled() => return PathEnd::Cancelled,
                read = client.read(&mut client_buf) => match read {
                    Ok(0) | Err(_) => {
                        let _ = direct_write.shutdown().await;
                        return PathEnd::Closed(CloseReason::ClientClosed);
                    }
                    Ok(n) => {
                        if let Err(e) = direct_write.write_all(&client_buf[..n]).await {
                            if untouched {
                                pending.extend_from_slice(&client_buf[..n]);
                                return PathEnd::Fallback(e.to_string());
                            }
                            return PathEnd::Closed(CloseReason::DirectClosed);
                        }
                        counters.from_client += n as u64;
                    }
                },
                read = direct_read.read(&mut direct_buf) => match read {
                    Ok(0) if untouched => return PathEnd::Fallback("direct connection closed".to_string()),
                    Err(e) if untouched => return PathEnd::Fallback(e.to_string()),
                    Ok(0) | Err(_) => return PathEnd::Closed(CloseReason::DirectClosed),
                    Ok(n) => {
                        if client.write_all(&direct_buf[..n]).await.is_err() {
                            return PathEnd::Closed(CloseReason::ClientClosed);
                        }
                        counters.to_client += n as u64;
                    }
                },
            }
        }
    }

    /// Relay the session through the agent's control channel
    #[allow(clippy::too_many_arguments)]
    async fn relay<S>(
        &self,
        channel: &AgentChannel,
        session_id: SessionId,
        client_peer: SocketAddr,
        client: &mut S,
        pending: BytesMut,
        signals: &mut mpsc::Receiver<ClientSignal>,
        counters: &mut Counters,
        cancel: &CancellationToken,
    ) -> PathEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.lock().sessions.mark_announced(&session_id);
        let announce = ControlMessage::NewSshConnection {
            session_id,
            client_info: client_peer.into(),
        };
        if channel.send(announce).await.is_err() {
            return PathEnd::Closed(CloseReason::AgentLost);
        }
        // A close that raced the announcement may have been queued first
        if cancel.is_cancelled() {
            channel.notify(ControlMessage::session_close(session_id, None));
            return PathEnd::Cancelled;
        }

        debug!(session_id = %session_id, "Session relayed through agent");

        if !pending.is_empty() {
            counters.from_client += pending.len() as u64;
            let msg = ControlMessage::session_data(session_id, Direction::ClientToServer, pending.to_vec());
            if channel.send(msg).await.is_err() {
                return PathEnd::Closed(CloseReason::AgentLost);
            }
        }

        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return PathEnd::Cancelled,
                read = client.read(&mut buf) => match read {
                    Ok(0) => return PathEnd::Closed(CloseReason::ClientClosed),
                    Err(e) => {
                        debug!(session_id = %session_id, "Client read error: {}", e);
                        return PathEnd::Closed(CloseReason::ClientClosed);
                    }
                    Ok(n) => {
                        let msg = ControlMessage::session_data(
                            session_id,
                            Direction::ClientToServer,
                            buf[..n].to_vec(),
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return PathEnd::Cancelled,
                            sent = channel.send(msg) => {
                                if sent.is_err() {
                                    return PathEnd::Closed(CloseReason::AgentLost);
                                }
                            }
                        }
                        counters.from_client += n as u64;
                    }
                },
                signal = signals.recv() => match signal {
                    Some(ClientSignal::Data(data)) => {
                        if client.write_all(&data).await.is_err() {
                            return PathEnd::Closed(CloseReason::ClientClosed);
                        }
                        counters.to_client += data.len() as u64;
                    }
                    Some(ClientSignal::Close(reason)) => {
                        return PathEnd::Closed(CloseReason::AgentClosed(reason));
                    }
                    None => return PathEnd::Cancelled,
                },
            }
        }
    }
}

async fn bounded<F: std::future::Future>(
    limit: Duration,
    fut: F,
) -> Result<F::Output, DirectPathError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DirectPathError::TimedOut(limit))
}
