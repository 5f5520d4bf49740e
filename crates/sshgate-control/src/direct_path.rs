//! Direct-path attempt collaborators
//!
//! The broker only needs a yes/no answer and, on yes, an endpoint it can dial.
//! How that answer is reached (UDP hole punching, a rendezvous service, a
//! plain reachability probe) is up to the implementation. The broker bounds
//! every attempt with its own timeout.

use async_trait::async_trait;
use sshgate_proto::NatDescriptor;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectPathError {
    #[error("Direct paths are disabled")]
    Disabled,

    #[error("Agent has no usable public address")]
    NoPublicAddress,

    #[error("Direct endpoint {address} unreachable: {reason}")]
    Unreachable { address: SocketAddr, reason: String },

    #[error("Direct path attempt timed out after {0:?}")]
    TimedOut(Duration),
}

/// What the broker knows about the session it wants a direct path for
#[derive(Debug, Clone)]
pub struct DirectTarget {
    pub agent_id: String,
    pub declared_listen_port: u16,
    pub client_peer: SocketAddr,
}

#[async_trait]
pub trait DirectPathAttempt: Send + Sync {
    /// Try to establish a direct path; on success return the endpoint the
    /// broker should connect to
    async fn attempt(
        &self,
        client: &NatDescriptor,
        agent: &NatDescriptor,
        target: &DirectTarget,
    ) -> Result<SocketAddr, DirectPathError>;
}

/// Always fails; used when the relay is configured without direct paths
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDirectPath;

#[async_trait]
impl DirectPathAttempt for NoDirectPath {
    async fn attempt(
        &self,
        _client: &NatDescriptor,
        _agent: &NatDescriptor,
        _target: &DirectTarget,
    ) -> Result<SocketAddr, DirectPathError> {
        Err(DirectPathError::Disabled)
    }
}

/// Probes the agent's public address on its declared listen port
///
/// Succeeds when a TCP connection can be opened there, i.e. when the agent's
/// backend is reachable without going through the relay.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl DirectPathAttempt for TcpProbe {
    async fn attempt(
        &self,
        _client: &NatDescriptor,
        agent: &NatDescriptor,
        target: &DirectTarget,
    ) -> Result<SocketAddr, DirectPathError> {
        let ip: IpAddr = agent
            .public_address
            .as_deref()
            .and_then(|addr| addr.parse().ok())
            .ok_or(DirectPathError::NoPublicAddress)?;
        let address = SocketAddr::new(ip, target.declared_listen_port);

        tracing::debug!(agent_id = %target.agent_id, %address, "Probing direct endpoint");

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_probe)) => Ok(address),
            Ok(Err(e)) => Err(DirectPathError::Unreachable {
                address,
                reason: e.to_string(),
            }),
            Err(_) => Err(DirectPathError::TimedOut(self.connect_timeout)),
        }
    }
}
