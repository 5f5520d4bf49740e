//! Per-session backend forwarding
//!
//! Each announced session gets one task that dials the backend and then
//! shuttles bytes between the backend socket and the control channel.

use sshgate_proto::{ControlMessage, Direction, SessionId};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors that can occur during backend forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to backend {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to backend {address}")]
    ConnectTimeout { address: String },

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control channel closed")]
    ChannelClosed,
}

/// Bytes moved by one session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

#[derive(Debug)]
enum BackendCommand {
    Data(Vec<u8>),
    Close,
}

/// Handle to a running session task
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<BackendCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue client bytes for the backend; order is preserved, including
    /// bytes that arrive before the backend connect completes
    pub fn send_data(&self, data: Vec<u8>) -> bool {
        self.commands.send(BackendCommand::Data(data)).is_ok()
    }

    /// Relay released the session; shut the backend down without replying
    pub fn close(&self) {
        let _ = self.commands.send(BackendCommand::Close);
    }

    /// Drop the session immediately (control channel lost)
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Dials the backend for each session
#[derive(Debug, Clone)]
pub struct BackendForwarder {
    backend_addr: String,
    connect_timeout: Duration,
}

impl BackendForwarder {
    pub fn new(backend_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            backend_addr: backend_addr.into(),
            connect_timeout,
        }
    }

    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    /// Start forwarding for a session
    ///
    /// Messages for the relay go out through `outbound`. When the task ends
    /// its session id is sent on `finished`.
    pub fn spawn(
        &self,
        session_id: SessionId,
        outbound: mpsc::Sender<ControlMessage>,
        finished: mpsc::UnboundedSender<SessionId>,
    ) -> SessionHandle {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let forwarder = self.clone();

        let task = tokio::spawn(async move {
            match forwarder.forward(session_id, commands_rx, &outbound).await {
                Ok(stats) => tracing::info!(
                    session_id = %session_id,
                    bytes_to_backend = stats.bytes_to_backend,
                    bytes_from_backend = stats.bytes_from_backend,
                    "Session forward completed"
                ),
                Err(e) => tracing::warn!(session_id = %session_id, "Session forward failed: {}", e),
            }
            let _ = finished.send(session_id);
        });

        SessionHandle { commands, task }
    }

    async fn forward(
        &self,
        session_id: SessionId,
        mut commands: mpsc::UnboundedReceiver<BackendCommand>,
        outbound: &mpsc::Sender<ControlMessage>,
    ) -> Result<ForwardStats, ForwarderError> {
        let backend = match self.connect().await {
            Ok(backend) => backend,
            Err(e) => {
                let reason = format!("backend unreachable: {}", e);
                let _ = outbound
                    .send(ControlMessage::session_close(session_id, Some(reason)))
                    .await;
                return Err(e);
            }
        };

        tracing::debug!(session_id = %session_id, backend = %self.backend_addr, "Connected to backend");

        let (mut backend_read, mut backend_write) = backend.into_split();
        let mut stats = ForwardStats::default();
        let mut buffer = vec![0u8; 16384]; // 16KB buffer

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(BackendCommand::Data(data)) => {
                        if let Err(e) = backend_write.write_all(&data).await {
                            let _ = outbound
                                .send(ControlMessage::session_close(session_id, Some(format!("backend write failed: {}", e))))
                                .await;
                            return Err(e.into());
                        }
                        stats.bytes_to_backend += data.len() as u64;
                    }
                    Some(BackendCommand::Close) | None => {
                        tracing::debug!(session_id = %session_id, "Relay closed session");
                        let _ = backend_write.shutdown().await;
                        return Ok(stats);
                    }
                },
                read = backend_read.read(&mut buffer) => match read {
                    Ok(0) => {
                        tracing::debug!(session_id = %session_id, "Backend connection closed");
                        outbound
                            .send(ControlMessage::session_close(session_id, Some("backend closed".to_string())))
                            .await
                            .map_err(|_| ForwarderError::ChannelClosed)?;
                        return Ok(stats);
                    }
                    Ok(n) => {
                        let msg = ControlMessage::session_data(
                            session_id,
                            Direction::ServerToClient,
                            buffer[..n].to_vec(),
                        );
                        outbound.send(msg).await.map_err(|_| ForwarderError::ChannelClosed)?;
                        stats.bytes_from_backend += n as u64;
                    }
                    Err(e) => {
                        let _ = outbound
                            .send(ControlMessage::session_close(session_id, Some(format!("backend read failed: {}", e))))
                            .await;
                        return Err(e.into());
                    }
                },
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, ForwarderError> {
        let address = self.backend_addr.clone();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ForwarderError::ConnectTimeout {
                address: address.clone(),
            })?
            .map_err(|source| ForwarderError::ConnectionFailed { address, source })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}
