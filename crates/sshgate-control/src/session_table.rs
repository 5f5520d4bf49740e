//! In-flight session bookkeeping
//!
//! The table is the single source of truth for which sessions exist and what
//! mode each is in. Removal is the cleanup ticket: whoever gets the entry back
//! from [`SessionTable::remove`] performs the teardown, everyone else sees
//! `None` and does nothing.

use sshgate_proto::SessionId;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Session lifecycle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    Pending,
    DirectAttempt,
    Relayed,
    Direct,
    Closed,
}

impl SessionMode {
    /// Forward-only transition table
    pub fn can_transition_to(self, next: SessionMode) -> bool {
        use SessionMode::*;

        matches!(
            (self, next),
            (Pending, DirectAttempt)
                | (Pending, Relayed)
                | (DirectAttempt, Direct)
                | (DirectAttempt, Relayed)
                | (Direct, Relayed)
                | (Pending | DirectAttempt | Relayed | Direct, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Pending => "pending",
            SessionMode::DirectAttempt => "direct-attempt",
            SessionMode::Relayed => "relayed",
            SessionMode::Direct => "direct",
            SessionMode::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Illegal session transition {from} -> {to}")]
    Illegal { from: SessionMode, to: SessionMode },

    #[error("Session already exists: {0}")]
    Duplicate(SessionId),
}

/// Signals queued for one client before the session is dropped as too slow
///
/// The agent reader never waits on a client; a client that falls this far
/// behind is closed instead of growing the relay's memory.
pub const CLIENT_QUEUE_DEPTH: usize = 256;

/// Something the agent side wants the client task to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    /// Backend bytes to write to the client, in arrival order
    Data(Vec<u8>),
    /// The agent released the session
    Close(Option<String>),
}

/// A tracked session
#[derive(Debug)]
pub struct SessionEntry {
    pub session_id: SessionId,
    pub client_peer: SocketAddr,
    /// Non-owning reference to the serving agent
    pub agent_id: String,
    /// Control channel of the registration the session was attached to
    pub channel_id: u64,
    pub mode: SessionMode,
    pub direct_endpoint: Option<SocketAddr>,
    pub started_at: Instant,
    /// Whether `new-ssh-connection` went out to the agent
    pub announced: bool,
    /// Cancelled when the session closes
    pub cancel: CancellationToken,
    /// Feed into the client task
    pub to_client: mpsc::Sender<ClientSignal>,
}

impl SessionEntry {
    pub fn new(
        session_id: SessionId,
        client_peer: SocketAddr,
        agent_id: String,
        channel_id: u64,
        cancel: CancellationToken,
        to_client: mpsc::Sender<ClientSignal>,
    ) -> Self {
        Self {
            session_id,
            client_peer,
            agent_id,
            channel_id,
            mode: SessionMode::Pending,
            direct_endpoint: None,
            started_at: Instant::now(),
            announced: false,
            cancel,
            to_client,
        }
    }

    /// Whether the session is served by this agent registration
    pub fn is_owned_by(&self, agent_id: &str, channel_id: u64) -> bool {
        self.agent_id == agent_id && self.channel_id == channel_id
    }
}

/// Table of in-flight sessions keyed by session id
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, SessionEntry>,
    high_water_mark: usize,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new session; duplicate ids are refused
    pub fn insert(&mut self, entry: SessionEntry) -> Result<(), TransitionError> {
        if self.sessions.contains_key(&entry.session_id) {
            return Err(TransitionError::Duplicate(entry.session_id));
        }
        self.sessions.insert(entry.session_id, entry);
        self.high_water_mark = self.high_water_mark.max(self.sessions.len());
        Ok(())
    }

    /// Move a session to `next`, returning the previous mode
    ///
    /// Illegal transitions leave the mode unchanged.
    pub fn transition(
        &mut self,
        session_id: &SessionId,
        next: SessionMode,
    ) -> Result<SessionMode, TransitionError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or(TransitionError::UnknownSession(*session_id))?;

        let from = entry.mode;
        if !from.can_transition_to(next) {
            return Err(TransitionError::Illegal { from, to: next });
        }

        entry.mode = next;
        tracing::debug!(session_id = %session_id, %from, to = %next, "Session mode changed");
        Ok(from)
    }

    pub fn set_direct_endpoint(&mut self, session_id: &SessionId, endpoint: Option<SocketAddr>) {
        if let Some(entry) = self.sessions.get_mut(session_id) {
            entry.direct_endpoint = endpoint;
        }
    }

    pub fn mark_announced(&mut self, session_id: &SessionId) {
        if let Some(entry) = self.sessions.get_mut(session_id) {
            entry.announced = true;
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    pub fn mode(&self, session_id: &SessionId) -> Option<SessionMode> {
        self.sessions.get(session_id).map(|entry| entry.mode)
    }

    /// Take a session out of the table, marking it closed
    ///
    /// Only the first caller for a given id gets `Some`.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<SessionEntry> {
        self.sessions.remove(session_id).map(|mut entry| {
            entry.mode = SessionMode::Closed;
            entry
        })
    }

    pub fn drain(&mut self) -> Vec<SessionEntry> {
        self.sessions
            .drain()
            .map(|(_, mut entry)| {
                entry.mode = SessionMode::Closed;
                entry
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Largest number of sessions that were ever tracked at once
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}
