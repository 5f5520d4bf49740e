//! Private-network agent
//!
//! Dials out to the relay, registers, and for every announced session opens a
//! connection to the local backend service and mirrors bytes in both
//! directions over the control channel.

pub mod agent;
pub mod config;
pub mod forwarder;
pub mod reconnect;

pub use agent::{Agent, AgentError};
pub use config::AgentConfig;
pub use forwarder::{BackendForwarder, ForwardStats, ForwarderError, SessionHandle};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
