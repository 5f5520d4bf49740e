//! Agent configuration

use crate::reconnect::ReconnectConfig;
use sshgate_proto::{DEFAULT_CONTROL_PORT, DEFAULT_SSH_PORT};
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Unique identifier for this agent
    pub agent_id: String,

    /// Relay control endpoint (host:port)
    pub relay_addr: String,

    /// Shared secret presented at registration
    pub auth_token: String,

    /// Host the backend service listens on
    pub backend_host: String,

    /// Port the backend service listens on; announced to the relay
    pub ssh_port: u16,

    /// Bound on dialing the relay, the registration reply, and backend connects
    pub connect_timeout: Duration,

    /// How often to ping the relay
    pub heartbeat_interval: Duration,

    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            relay_addr: format!("localhost:{}", DEFAULT_CONTROL_PORT),
            auth_token: String::new(),
            backend_host: "localhost".to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Address of the backend service as dialed for each session
    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.ssh_port)
    }
}
