//! Protocol message types

use crate::nat::NatDescriptor;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Identifier of a relayed client session
pub type SessionId = Uuid;

/// Control channel message exchanged between the relay and an agent
///
/// The framing is symmetric but the message set is not: only the agent sends
/// `RegisterAgent`, only the relay sends `RegistrationResult` and
/// `NewSshConnection`, and `SshData` carries a direction tag so each side knows
/// which way the payload flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Agent announces itself and the port its backend service listens on
    #[serde(rename_all = "camelCase")]
    RegisterAgent {
        agent_id: String,
        auth_token: String,
        ssh_port: u16,
    },
    /// Relay answers a registration attempt
    #[serde(rename_all = "camelCase")]
    RegistrationResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nat_info: Option<NatDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Relay announces a relayed session; the agent must dial its backend
    #[serde(rename = "new-ssh-connection", rename_all = "camelCase")]
    NewSshConnection {
        session_id: SessionId,
        client_info: ClientInfo,
    },
    /// A chunk of session payload, in either direction
    #[serde(rename = "ssh-data", rename_all = "camelCase")]
    SshData {
        session_id: SessionId,
        direction: Direction,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Either side has released its end of a session
    #[serde(rename = "ssh-close", rename_all = "camelCase")]
    SshClose {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Informational outcome of a direct-path attempt
    #[serde(rename = "p2p-result", rename_all = "camelCase")]
    P2pResult {
        session_id: SessionId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl ControlMessage {
    pub fn session_data(session_id: SessionId, direction: Direction, data: Vec<u8>) -> Self {
        ControlMessage::SshData {
            session_id,
            direction,
            data,
        }
    }

    pub fn session_close(session_id: SessionId, reason: Option<String>) -> Self {
        ControlMessage::SshClose { session_id, reason }
    }

    pub fn registration_accepted(nat_info: NatDescriptor) -> Self {
        ControlMessage::RegistrationResult {
            success: true,
            nat_info: Some(nat_info),
            error: None,
        }
    }

    pub fn registration_rejected(error: impl Into<String>) -> Self {
        ControlMessage::RegistrationResult {
            success: false,
            nat_info: None,
            error: Some(error.into()),
        }
    }

    /// Session this message belongs to, if it is session-scoped
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ControlMessage::NewSshConnection { session_id, .. }
            | ControlMessage::SshData { session_id, .. }
            | ControlMessage::SshClose { session_id, .. }
            | ControlMessage::P2pResult { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// Wire name of the message, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::RegisterAgent { .. } => "register-agent",
            ControlMessage::RegistrationResult { .. } => "registration-result",
            ControlMessage::NewSshConnection { .. } => "new-ssh-connection",
            ControlMessage::SshData { .. } => "ssh-data",
            ControlMessage::SshClose { .. } => "ssh-close",
            ControlMessage::P2pResult { .. } => "p2p-result",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
        }
    }
}

/// Which way a payload chunk travels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Peer information of the client behind a relayed session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub address: String,
    pub port: u16,
}

impl From<SocketAddr> for ClientInfo {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

// Payload bytes travel as base64 text inside the JSON frame
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
