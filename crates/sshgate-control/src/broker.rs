//! Connection broker
//!
//! Owns the agent registry and the session table behind one mutex. Every
//! mutation of either table happens in a short critical section with no
//! `.await` inside; teardown side effects (cancelling session tasks, notifying
//! agents) run after the lock is released.

use crate::agent_registry::{Agent, AgentRegistry};
use crate::connection::AgentChannel;
use crate::direct_path::{DirectPathAttempt, DirectPathError, NoDirectPath, TcpProbe};
use crate::nat::{AddressClassifier, PeerAddressClassifier};
use crate::session_table::{
    ClientSignal, SessionEntry, SessionMode, SessionTable, TransitionError, CLIENT_QUEUE_DEPTH,
};
use sshgate_auth::{AuthError, CredentialVerifier};
use sshgate_proto::{ControlMessage, NatDescriptor, ReachabilityClass, SessionId};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broker tuning
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Whether sessions may try a direct path before falling back to relay
    pub direct_path_enabled: bool,
    /// Bound on the direct-path attempt and on the follow-up connect
    pub direct_attempt_timeout: Duration,
    /// Agents silent for this long are dropped
    pub liveness_window: Duration,
    /// Read buffer size for client and direct sockets
    pub read_buffer_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            direct_path_enabled: true,
            direct_attempt_timeout: Duration::from_secs(2),
            liveness_window: crate::agent_registry::LIVENESS_WINDOW,
            read_buffer_size: 16 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No live agent available")]
    NoAgentAvailable,

    #[error("Direct path failed: {0}")]
    DirectPathFailure(#[from] DirectPathError),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Agent lost: {0}")]
    AgentLost(String),

    #[error("Session state error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a session was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    DirectClosed,
    /// The agent sent `ssh-close`
    AgentClosed(Option<String>),
    /// The agent's control channel went away
    AgentLost,
    /// The agent re-registered on a new channel
    Replaced,
    /// The client fell too far behind the agent's output
    ClientTooSlow,
    Shutdown,
    SetupFailed(String),
}

impl CloseReason {
    /// Whether the agent still needs an `ssh-close` for this session
    fn notifies_agent(&self) -> bool {
        !matches!(self, CloseReason::AgentClosed(_) | CloseReason::AgentLost)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::DirectClosed => f.write_str("direct connection closed"),
            CloseReason::AgentClosed(Some(reason)) => write!(f, "agent closed: {}", reason),
            CloseReason::AgentClosed(None) => f.write_str("agent closed"),
            CloseReason::AgentLost => f.write_str("agent lost"),
            CloseReason::Replaced => f.write_str("agent re-registered"),
            CloseReason::ClientTooSlow => f.write_str("client too slow"),
            CloseReason::Shutdown => f.write_str("relay shutting down"),
            CloseReason::SetupFailed(reason) => write!(f, "setup failed: {}", reason),
        }
    }
}

pub(crate) struct Tables {
    pub(crate) agents: AgentRegistry,
    pub(crate) sessions: SessionTable,
}

/// A session that was just admitted
pub(crate) struct OpenedSession {
    pub(crate) session_id: SessionId,
    pub(crate) agent: Agent,
    pub(crate) cancel: CancellationToken,
    pub(crate) signals: mpsc::Receiver<ClientSignal>,
}

/// Side effects of closing a session, applied outside the lock
struct Teardown {
    entry: SessionEntry,
    notify: Option<AgentChannel>,
}

impl Teardown {
    fn apply(self, reason: &CloseReason) {
        let entry = self.entry;
        entry.cancel.cancel();

        if let Some(channel) = self.notify {
            channel.notify(ControlMessage::session_close(
                entry.session_id,
                Some(reason.to_string()),
            ));
        }

        info!(
            session_id = %entry.session_id,
            agent_id = %entry.agent_id,
            client = %entry.client_peer,
            duration_ms = entry.started_at.elapsed().as_millis() as u64,
            reason = %reason,
            "Session closed"
        );
    }
}

/// Per-process broker between inbound clients and registered agents
pub struct ConnectionBroker {
    pub(crate) config: BrokerConfig,
    tables: Mutex<Tables>,
    verifier: Arc<dyn CredentialVerifier>,
    pub(crate) classifier: Arc<dyn AddressClassifier>,
    pub(crate) direct_path: Arc<dyn DirectPathAttempt>,
    pub(crate) shutdown: CancellationToken,
}

impl ConnectionBroker {
    pub fn new(config: BrokerConfig, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let direct_path: Arc<dyn DirectPathAttempt> = if config.direct_path_enabled {
            Arc::new(TcpProbe::new(config.direct_attempt_timeout))
        } else {
            Arc::new(NoDirectPath)
        };

        Self {
            tables: Mutex::new(Tables {
                agents: AgentRegistry::with_liveness_window(config.liveness_window),
                sessions: SessionTable::new(),
            }),
            config,
            verifier,
            classifier: Arc::new(PeerAddressClassifier::new()),
            direct_path,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn AddressClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_direct_path(mut self, direct_path: Arc<dyn DirectPathAttempt>) -> Self {
        self.direct_path = direct_path;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Verify an agent's credential and record it
    ///
    /// A rejected credential creates no entry. A registration that replaces an
    /// existing one force-closes the old registration's sessions and, when it
    /// arrived on a different channel, closes the old channel.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        credential: &str,
        declared_listen_port: u16,
        nat: NatDescriptor,
        channel: AgentChannel,
    ) -> Result<Agent, AuthError> {
        if let Err(e) = self.verifier.verify(credential).await {
            warn!(agent_id = %agent_id, peer = %channel.peer_addr(), "Agent authentication failed: {}", e);
            return Err(e);
        }

        let agent = Agent {
            agent_id: agent_id.to_string(),
            channel,
            declared_listen_port,
            capable_of_direct_path: self.config.direct_path_enabled
                && nat.reachability_class != ReachabilityClass::Symmetric,
            nat,
            connected_at: chrono::Utc::now(),
            last_seen_at: Instant::now(),
        };

        let (replaced, teardowns) = {
            let mut tables = self.lock();
            let replaced = tables.agents.register_or_replace(agent.clone());
            let teardowns = match replaced {
                Some(ref old) => old
                    .sessions
                    .iter()
                    .filter_map(|id| Self::close_locked(&mut tables, id, &CloseReason::Replaced))
                    .collect(),
                None => Vec::new(),
            };
            (replaced, teardowns)
        };

        for teardown in teardowns {
            teardown.apply(&CloseReason::Replaced);
        }
        if let Some(old) = replaced {
            // Re-registering on the same channel keeps that channel
            if old.agent.channel_id() != agent.channel_id() {
                old.agent.channel.close();
            }
        }

        info!(
            agent_id = %agent.agent_id,
            channel_id = agent.channel_id(),
            ssh_port = declared_listen_port,
            nat = %agent.nat.reachability_class,
            direct_capable = agent.capable_of_direct_path,
            "✅ Agent registered"
        );

        Ok(agent)
    }

    /// Refresh an agent's liveness, but only from its current channel
    pub fn touch_agent(&self, agent_id: &str, channel_id: u64) {
        let mut tables = self.lock();
        if tables.agents.is_current(agent_id, channel_id) {
            tables.agents.touch(agent_id);
        }
    }

    /// Drop an agent registration and force-close its sessions
    ///
    /// A channel that has already been replaced removes nothing. Returns the
    /// number of sessions closed.
    pub fn remove_agent(&self, agent_id: &str, channel_id: u64) -> usize {
        let teardowns: Vec<Teardown> = {
            let mut tables = self.lock();
            match tables.agents.remove_channel(agent_id, channel_id) {
                Some(removed) => removed
                    .sessions
                    .iter()
                    .filter_map(|id| Self::close_locked(&mut tables, id, &CloseReason::AgentLost))
                    .collect(),
                None => return 0,
            }
        };

        let closed = teardowns.len();
        for teardown in teardowns {
            teardown.apply(&CloseReason::AgentLost);
        }

        if closed > 0 {
            warn!(agent_id = %agent_id, sessions = closed, "Agent lost, closed its sessions");
        }
        closed
    }

    /// Close a session
    ///
    /// Returns `true` for the call that actually performed the cleanup and
    /// `false` for every later one.
    pub fn close_session(&self, session_id: &SessionId, reason: CloseReason) -> bool {
        let teardown = {
            let mut tables = self.lock();
            Self::close_locked(&mut tables, session_id, &reason)
        };

        match teardown {
            Some(teardown) => {
                teardown.apply(&reason);
                true
            }
            None => {
                debug!(session_id = %session_id, reason = %reason, "Session already closed");
                false
            }
        }
    }

    fn close_locked(
        tables: &mut Tables,
        session_id: &SessionId,
        reason: &CloseReason,
    ) -> Option<Teardown> {
        let entry = tables.sessions.remove(session_id)?;
        tables.agents.detach_session(&entry.agent_id, session_id);

        let notify = if entry.announced
            && reason.notifies_agent()
            && tables.agents.is_current(&entry.agent_id, entry.channel_id)
        {
            tables.agents.get(&entry.agent_id).map(|agent| agent.channel.clone())
        } else {
            None
        };

        Some(Teardown { entry, notify })
    }

    /// Pick a live agent and admit a new session for `client_peer`
    pub(crate) fn open_session(&self, client_peer: SocketAddr) -> Result<OpenedSession, BrokerError> {
        let mut tables = self.lock();
        let agent = tables
            .agents
            .select_live()
            .cloned()
            .ok_or(BrokerError::NoAgentAvailable)?;

        let session_id = Uuid::new_v4();
        if !tables
            .agents
            .attach_session(&agent.agent_id, agent.channel_id(), session_id)
        {
            return Err(BrokerError::NoAgentAvailable);
        }

        let cancel = self.shutdown.child_token();
        let (to_client, signals) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let entry = SessionEntry::new(
            session_id,
            client_peer,
            agent.agent_id.clone(),
            agent.channel_id(),
            cancel.clone(),
            to_client,
        );

        if let Err(e) = tables.sessions.insert(entry) {
            tables.agents.detach_session(&agent.agent_id, &session_id);
            return Err(e.into());
        }

        Ok(OpenedSession {
            session_id,
            agent,
            cancel,
            signals,
        })
    }

    pub(crate) fn transition(
        &self,
        session_id: &SessionId,
        next: SessionMode,
    ) -> Result<SessionMode, TransitionError> {
        self.lock().sessions.transition(session_id, next)
    }

    pub fn session_mode(&self, session_id: &SessionId) -> Option<SessionMode> {
        self.lock().sessions.mode(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Peak number of concurrently tracked sessions
    pub fn max_concurrent_sessions(&self) -> usize {
        self.lock().sessions.high_water_mark()
    }

    pub fn agent_count(&self) -> usize {
        self.lock().agents.count()
    }

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.lock().agents.get(agent_id).cloned()
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.lock().agents.list()
    }

    /// Sessions currently attached to an agent
    pub fn agent_session_count(&self, agent_id: &str) -> usize {
        self.lock().agents.session_count(agent_id)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every session and drop every agent
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let (sessions, agents) = {
            let mut tables = self.lock();
            (tables.sessions.drain(), tables.agents.drain())
        };

        info!(
            sessions = sessions.len(),
            agents = agents.len(),
            "Shutting down connection broker"
        );

        for entry in sessions {
            Teardown { entry, notify: None }.apply(&CloseReason::Shutdown);
        }
        for removed in agents {
            removed.agent.channel.close();
        }
    }
}

impl fmt::Debug for ConnectionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshgate_auth::SharedSecretVerifier;

    const TOKEN: &str = "test-secret";

    fn broker() -> ConnectionBroker {
        ConnectionBroker::new(
            BrokerConfig::default(),
            Arc::new(SharedSecretVerifier::new(TOKEN)),
        )
    }

    fn channel() -> (AgentChannel, mpsc::Receiver<ControlMessage>) {
        AgentChannel::new("10.0.0.2:41000".parse().unwrap())
    }

    fn cone() -> NatDescriptor {
        NatDescriptor::new(ReachabilityClass::Cone, Some("10.0.0.2".to_string()))
    }

    fn client() -> SocketAddr {
        "192.168.7.7:51000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_bad_credential() {
        let broker = broker();
        let (ch, _rx) = channel();
        let err = broker
            .register_agent("agent1", "wrong", 22, cone(), ch)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredential);
        assert_eq!(broker.agent_count(), 0);
    }

    #[tokio::test]
    async fn test_symmetric_agent_is_not_direct_capable() {
        let broker = broker();
        let (ch, _rx) = channel();
        let nat = NatDescriptor::new(ReachabilityClass::Symmetric, None);
        let agent = broker.register_agent("agent1", TOKEN, 22, nat, ch).await.unwrap();
        assert!(!agent.capable_of_direct_path);
    }

    #[tokio::test]
    async fn test_disabled_direct_path_clears_capability() {
        let config = BrokerConfig {
            direct_path_enabled: false,
            ..Default::default()
        };
        let broker = ConnectionBroker::new(config, Arc::new(SharedSecretVerifier::new(TOKEN)));
        let (ch, _rx) = channel();
        let agent = broker.register_agent("agent1", TOKEN, 22, cone(), ch).await.unwrap();
        assert!(!agent.capable_of_direct_path);
    }

    #[tokio::test]
    async fn test_open_session_requires_live_agent() {
        let broker = broker();
        assert!(matches!(
            broker.open_session(client()),
            Err(BrokerError::NoAgentAvailable)
        ));
    }

    #[tokio::test]
    async fn test_close_session_exactly_once() {
        let broker = broker();
        let (ch, mut rx) = channel();
        broker.register_agent("agent1", TOKEN, 22, cone(), ch).await.unwrap();

        let opened = broker.open_session(client()).unwrap();
        let id = opened.session_id;
        broker.transition(&id, SessionMode::Relayed).unwrap();
        broker.lock().sessions.mark_announced(&id);

        assert!(broker.close_session(&id, CloseReason::ClientClosed));
        assert!(!broker.close_session(&id, CloseReason::ClientClosed));
        assert!(opened.cancel.is_cancelled());
        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.agent_session_count("agent1"), 0);

        // Exactly one ssh-close reaches the agent
        match rx.recv().await.unwrap() {
            ControlMessage::SshClose { session_id, .. } => assert_eq!(session_id, id),
            other => panic!("Expected SshClose, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unannounced_session_close_is_silent() {
        let broker = broker();
        let (ch, mut rx) = channel();
        broker.register_agent("agent1", TOKEN, 22, cone(), ch).await.unwrap();

        let opened = broker.open_session(client()).unwrap();
        assert!(broker.close_session(&opened.session_id, CloseReason::ClientClosed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_agent_closes_only_its_sessions() {
        let broker = broker();
        let (ch1, _rx1) = channel();
        let channel_id = ch1.id();
        broker.register_agent("agent1", TOKEN, 22, cone(), ch1).await.unwrap();

        let mut first = Vec::new();
        for _ in 0..3 {
            first.push(broker.open_session(client()).unwrap());
        }

        let (ch2, _rx2) = channel();
        broker.register_agent("agent2", TOKEN, 22, cone(), ch2).await.unwrap();

        let other = Uuid::new_v4();
        {
            let mut tables = broker.lock();
            let ch2_id = tables.agents.get("agent2").unwrap().channel_id();
            assert!(tables.agents.attach_session("agent2", ch2_id, other));
        }

        assert_eq!(broker.remove_agent("agent1", channel_id), 3);
        for opened in &first {
            assert!(opened.cancel.is_cancelled());
        }
        assert_eq!(broker.agent_count(), 1);
        assert_eq!(broker.agent_session_count("agent2"), 1);
    }

    #[tokio::test]
    async fn test_replacement_closes_old_sessions_and_channel() {
        let broker = broker();
        let (old, _old_rx) = channel();
        let old_id = old.id();
        broker.register_agent("agent1", TOKEN, 22, cone(), old.clone()).await.unwrap();
        let opened = broker.open_session(client()).unwrap();

        let (new, _new_rx) = channel();
        broker.register_agent("agent1", TOKEN, 2222, cone(), new).await.unwrap();

        assert!(opened.cancel.is_cancelled());
        assert!(old.is_closed());
        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.agent("agent1").unwrap().declared_listen_port, 2222);

        // The stale channel cannot take the replacement down
        assert_eq!(broker.remove_agent("agent1", old_id), 0);
        assert_eq!(broker.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_on_same_channel_keeps_channel() {
        let broker = broker();
        let (ch, mut rx) = channel();
        broker.register_agent("agent1", TOKEN, 22, cone(), ch.clone()).await.unwrap();

        let opened = broker.open_session(client()).unwrap();
        let id = opened.session_id;
        broker.transition(&id, SessionMode::Relayed).unwrap();
        broker.lock().sessions.mark_announced(&id);

        broker.register_agent("agent1", TOKEN, 2200, cone(), ch.clone()).await.unwrap();

        assert!(opened.cancel.is_cancelled());
        assert!(!ch.is_closed());
        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.agent_count(), 1);
        assert_eq!(broker.agent("agent1").unwrap().declared_listen_port, 2200);

        // The agent is told to release the backend of the replaced session
        match rx.recv().await.unwrap() {
            ControlMessage::SshClose { session_id, reason } => {
                assert_eq!(session_id, id);
                assert_eq!(reason.as_deref(), Some("agent re-registered"));
            }
            other => panic!("Expected SshClose, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_tables() {
        let broker = broker();
        let (ch, _rx) = channel();
        broker.register_agent("agent1", TOKEN, 22, cone(), ch.clone()).await.unwrap();
        let opened = broker.open_session(client()).unwrap();

        broker.shutdown();
        assert!(opened.cancel.is_cancelled());
        assert!(ch.is_closed());
        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.agent_count(), 0);
        assert!(broker.is_shutdown());
    }
}
