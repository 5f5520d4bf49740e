//! Agent registry for tracking connected private-network agents
//!
//! Each agent holds one control channel to the relay and declares the port its
//! backend service listens on. The registry tracks liveness (any inbound
//! control message refreshes it) and which sessions currently reference each
//! agent, so that removing an agent hands back exactly the sessions that must
//! be force-closed.
//!
//! The registry itself does no locking; the broker serializes access to it.

use crate::connection::AgentChannel;
use sshgate_proto::{NatDescriptor, SessionId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// An agent that has been silent for this long is no longer selectable
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// A registered agent with its connection metadata
#[derive(Debug, Clone)]
pub struct Agent {
    /// Unique identifier for this agent
    pub agent_id: String,
    /// Write handle of the control connection this registration arrived on
    pub channel: AgentChannel,
    /// Port of the backend service on the agent's side
    pub declared_listen_port: u16,
    /// NAT situation of the agent's control connection
    pub nat: NatDescriptor,
    pub capable_of_direct_path: bool,
    /// Wall-clock time the agent registered
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Last time any control message arrived from the agent
    pub last_seen_at: Instant,
}

impl Agent {
    pub fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    pub fn is_live_at(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_seen_at) < window
    }
}

/// An agent taken out of the registry together with the sessions that still
/// referenced it
#[derive(Debug)]
pub struct RemovedAgent {
    pub agent: Agent,
    pub sessions: Vec<SessionId>,
}

#[derive(Debug)]
struct AgentEntry {
    agent: Agent,
    sessions: HashSet<SessionId>,
}

/// Registry for managing connected agents
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentEntry>,
    liveness_window: Duration,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    pub fn new() -> Self {
        Self::with_liveness_window(LIVENESS_WINDOW)
    }

    pub fn with_liveness_window(liveness_window: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            liveness_window,
        }
    }

    /// Register a new agent or replace an existing one with the same id
    ///
    /// Returns the replaced registration, if any, with every session that was
    /// still attached to it. The caller must treat it as disconnected.
    pub fn register_or_replace(&mut self, agent: Agent) -> Option<RemovedAgent> {
        let agent_id = agent.agent_id.clone();
        let entry = AgentEntry {
            agent,
            sessions: HashSet::new(),
        };

        let replaced = self.agents.insert(agent_id.clone(), entry).map(|old| RemovedAgent {
            agent: old.agent,
            sessions: old.sessions.into_iter().collect(),
        });

        if let Some(ref old) = replaced {
            tracing::info!(
                agent_id = %agent_id,
                old_channel = old.agent.channel_id(),
                orphaned_sessions = old.sessions.len(),
                "Re-registered existing agent (replaced previous channel)"
            );
        } else {
            tracing::info!(agent_id = %agent_id, "Registered new agent");
        }

        replaced
    }

    /// Refresh the liveness timestamp of an agent; unknown ids are ignored
    pub fn touch(&mut self, agent_id: &str) {
        if let Some(entry) = self.agents.get_mut(agent_id) {
            entry.agent.last_seen_at = Instant::now();
        }
    }

    /// Pick any agent that has been heard from within the liveness window
    pub fn select_live(&self) -> Option<&Agent> {
        self.select_live_at(Instant::now())
    }

    pub fn select_live_at(&self, now: Instant) -> Option<&Agent> {
        self.agents
            .values()
            .map(|entry| &entry.agent)
            .find(|agent| agent.is_live_at(now, self.liveness_window) && !agent.channel.is_closed())
    }

    /// Remove an agent and return the sessions that referenced it
    pub fn remove(&mut self, agent_id: &str) -> Option<RemovedAgent> {
        let removed = self.agents.remove(agent_id).map(|entry| RemovedAgent {
            agent: entry.agent,
            sessions: entry.sessions.into_iter().collect(),
        });

        match removed {
            Some(ref r) => tracing::info!(
                agent_id = %agent_id,
                sessions = r.sessions.len(),
                "Unregistered agent"
            ),
            None => tracing::debug!(agent_id = %agent_id, "Attempted to unregister unknown agent"),
        }

        removed
    }

    /// Remove an agent only if it is still registered on `channel_id`
    ///
    /// A channel that was replaced by a newer registration must not take the
    /// replacement down with it when it finally closes.
    pub fn remove_channel(&mut self, agent_id: &str, channel_id: u64) -> Option<RemovedAgent> {
        if !self.is_current(agent_id, channel_id) {
            return None;
        }
        self.remove(agent_id)
    }

    /// Whether `channel_id` is the agent's current registration
    pub fn is_current(&self, agent_id: &str, channel_id: u64) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|entry| entry.agent.channel_id() == channel_id)
    }

    /// Record that a session references an agent registration
    ///
    /// Fails when the agent is gone or has been re-registered on another
    /// channel since it was selected.
    pub fn attach_session(&mut self, agent_id: &str, channel_id: u64, session_id: SessionId) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(entry) if entry.agent.channel_id() == channel_id => {
                entry.sessions.insert(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn detach_session(&mut self, agent_id: &str, session_id: &SessionId) {
        if let Some(entry) = self.agents.get_mut(agent_id) {
            entry.sessions.remove(session_id);
        }
    }

    /// Get information about a specific agent
    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id).map(|entry| &entry.agent)
    }

    /// Number of sessions currently referencing an agent
    pub fn session_count(&self, agent_id: &str) -> usize {
        self.agents
            .get(agent_id)
            .map(|entry| entry.sessions.len())
            .unwrap_or(0)
    }

    /// List all registered agents
    pub fn list(&self) -> Vec<Agent> {
        self.agents.values().map(|entry| entry.agent.clone()).collect()
    }

    /// Drain every agent, e.g. at shutdown
    pub fn drain(&mut self) -> Vec<RemovedAgent> {
        self.agents
            .drain()
            .map(|(_, entry)| RemovedAgent {
                agent: entry.agent,
                sessions: entry.sessions.into_iter().collect(),
            })
            .collect()
    }

    /// Get the total count of registered agents
    pub fn count(&self) -> usize {
        self.agents.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
