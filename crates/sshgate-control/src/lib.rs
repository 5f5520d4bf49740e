//! Relay control plane: agent registry, session table and the connection broker
pub mod agent_registry;
pub mod broker;
pub mod connection;
pub mod direct_path;
pub mod endpoint;
pub mod nat;
pub mod session;
pub mod session_table;

pub use agent_registry::{Agent, AgentRegistry, RemovedAgent, LIVENESS_WINDOW};
pub use broker::{BrokerConfig, BrokerError, CloseReason, ConnectionBroker};
pub use connection::{AgentChannel, ChannelClosed};
pub use direct_path::{DirectPathAttempt, DirectPathError, DirectTarget, NoDirectPath, TcpProbe};
pub use endpoint::DispatchOutcome;
pub use nat::{can_attempt_direct, AddressClassifier, PeerAddressClassifier};
pub use session::{SessionSummary, MAX_PENDING_BYTES};
pub use session_table::{
    ClientSignal, SessionEntry, SessionMode, SessionTable, TransitionError, CLIENT_QUEUE_DEPTH,
};
