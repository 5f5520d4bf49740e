//! Relay configuration

use sshgate_control::BrokerConfig;
use sshgate_proto::{DEFAULT_CONTROL_PORT, DEFAULT_SSH_PORT};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where clients connect (payload-agnostic, conventionally SSH)
    pub ssh_bind: SocketAddr,

    /// Where agents open their control channel
    pub control_bind: SocketAddr,

    /// Shared secret agents must present
    pub auth_token: String,

    /// Bind attempts per listener before giving up
    pub bind_attempts: u32,

    pub bind_retry_delay: Duration,

    pub broker: BrokerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ssh_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SSH_PORT)),
            control_bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONTROL_PORT)),
            auth_token: String::new(),
            bind_attempts: 3,
            bind_retry_delay: Duration::from_secs(1),
            broker: BrokerConfig::default(),
        }
    }
}
