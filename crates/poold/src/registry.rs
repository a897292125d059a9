use dashmap::DashMap;
use pool_common::ConnectionId;
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::mpsc;

/// Notification pushed from the pool manager into a session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotify {
    /// A chain-height announcement to forward to the miner.
    Height(u32),
    /// Cooperative shutdown; finish the current packet and close.
    Stop,
}

/// Handle held in the registry — used to notify a session's task.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    /// Channel sender for delivering notifications to this session's task.
    pub tx: mpsc::Sender<SessionNotify>,
    /// Remote address the miner connected from.
    pub remote_ip: IpAddr,
    /// Instant the connection was accepted (used for diagnostics).
    pub connected_at: Instant,
}

/// Concurrent connection-id → session table.
///
/// Reads (broadcast iteration, lookups) dominate; mutations happen only
/// on accept and close and touch a single shard.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, SessionHandle>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a session handle, returning any previous handle for the id.
    pub fn insert(&self, id: ConnectionId, handle: SessionHandle) -> Option<SessionHandle> {
        self.sessions.insert(id, handle)
    }

    /// Remove a session by id.
    pub fn remove(&self, id: ConnectionId) {
        self.sessions.remove(&id);
    }

    /// Look up a session handle by id.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every live session, for broadcast walks.
    #[must_use]
    pub fn handles(&self) -> Vec<(ConnectionId, SessionHandle)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
