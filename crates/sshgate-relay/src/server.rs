//! Relay server: listeners and accept loops

use crate::config::RelayConfig;
use sshgate_auth::SharedSecretVerifier;
use sshgate_control::{BrokerError, ConnectionBroker};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Relay server before its listeners are bound
pub struct RelayServer {
    config: RelayConfig,
    broker: Arc<ConnectionBroker>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let verifier = Arc::new(SharedSecretVerifier::new(&config.auth_token));
        let broker = Arc::new(ConnectionBroker::new(config.broker.clone(), verifier));
        Self { config, broker }
    }

    /// Use a preconfigured broker (custom classifier or direct-path strategy)
    pub fn with_broker(config: RelayConfig, broker: Arc<ConnectionBroker>) -> Self {
        Self { config, broker }
    }

    pub fn broker(&self) -> Arc<ConnectionBroker> {
        self.broker.clone()
    }

    /// Bind both listeners; a port that stays in use is fatal
    pub async fn bind(self) -> Result<BoundRelay, RelayServerError> {
        let attempts = self.config.bind_attempts.max(1);
        let delay = self.config.bind_retry_delay;

        let ssh_listener = bind_with_retry(self.config.ssh_bind, attempts, delay).await?;
        let control_listener = bind_with_retry(self.config.control_bind, attempts, delay).await?;

        Ok(BoundRelay {
            ssh_listener,
            control_listener,
            broker: self.broker,
        })
    }
}

/// Relay server with both listeners bound
pub struct BoundRelay {
    ssh_listener: TcpListener,
    control_listener: TcpListener,
    broker: Arc<ConnectionBroker>,
}

impl BoundRelay {
    pub fn ssh_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.ssh_listener.local_addr()?)
    }

    pub fn control_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.control_listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<ConnectionBroker> {
        self.broker.clone()
    }

    /// Accept connections until `shutdown` resolves, then drain the broker
    pub async fn serve<F>(self, shutdown: F) -> Result<(), RelayServerError>
    where
        F: Future<Output = ()>,
    {
        let ssh_addr = self.ssh_addr()?;
        let control_addr = self.control_addr()?;
        info!("🚀 SSH listener on {}", ssh_addr);
        info!("🎛️  Control listener on {}", control_addr);

        let clients = tokio::spawn(accept_clients(self.ssh_listener, self.broker.clone()));
        let agents = tokio::spawn(accept_agents(self.control_listener, self.broker.clone()));

        shutdown.await;

        info!("Shutting down relay");
        clients.abort();
        agents.abort();
        self.broker.shutdown();

        Ok(())
    }
}

async fn accept_clients(listener: TcpListener, broker: Arc<ConnectionBroker>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New client connection from {}", peer_addr);
                let _ = stream.set_nodelay(true);
                let broker = broker.clone();

                tokio::spawn(async move {
                    match broker.handle_client(stream, peer_addr).await {
                        Ok(summary) => debug!(
                            session_id = %summary.session_id,
                            mode = %summary.final_mode,
                            bytes_from_client = summary.bytes_from_client,
                            bytes_to_client = summary.bytes_to_client,
                            "Client connection finished"
                        ),
                        Err(BrokerError::NoAgentAvailable) => {
                            warn!("No live agent available, closing client {}", peer_addr)
                        }
                        Err(e) => warn!("Error handling client {}: {}", peer_addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept client connection: {}", e);
            }
        }
    }
}

async fn accept_agents(listener: TcpListener, broker: Arc<ConnectionBroker>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New agent control connection from {}", peer_addr);
                let _ = stream.set_nodelay(true);
                tokio::spawn(broker.clone().handle_agent_connection(stream, peer_addr));
            }
            Err(e) => {
                error!("Failed to accept agent connection: {}", e);
            }
        }
    }
}

/// Bind, retrying while the port is in use (e.g. sockets in TIME_WAIT)
async fn bind_with_retry(
    addr: SocketAddr,
    attempts: u32,
    delay: Duration,
) -> Result<TcpListener, RelayServerError> {
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Successfully bound to {} on attempt {}/{}", addr, attempt, attempts);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                warn!(
                    "Port {} is in use (attempt {}/{}, may be in TIME_WAIT state), retrying in {:?}...",
                    addr.port(),
                    attempt,
                    attempts,
                    delay
                );
                last_error = e.to_string();
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                last_error = e.to_string();
                break;
            }
        }
    }

    Err(RelayServerError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: last_error,
    })
}
