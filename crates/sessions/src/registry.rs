//! Session registry - connected clients of this node
//!
//! Each client session owns a bounded outbound queue; the registry maps
//! client ids to the sending half.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use timesync_timing::{ClientId, ClientRegistry, SyncError};
use tokio::sync::mpsc;

/// Outbound queue depth per client session
pub const CLIENT_QUEUE_DEPTH: usize = 64;

struct Session {
    id: u64,
    sender: mpsc::Sender<Vec<u8>>,
}

/// Tracks connected client sessions
pub struct SessionRegistry {
    sessions: DashMap<ClientId, Session>,
    next_session: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        }
    }

    /// Open a session for `client_id`, replacing any earlier one
    ///
    /// Returns the session id and the receiver the connection task drains.
    /// A replaced session's receiver is closed, which ends its connection.
    /// Client ids are self-declared, so a takeover is logged loudly.
    pub fn open(&self, client_id: &str) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(CLIENT_QUEUE_DEPTH);

        if let Some(previous) = self
            .sessions
            .insert(client_id.to_string(), Session { id, sender })
        {
            tracing::warn!(
                "Client id {} claimed by a new connection - closing session {}",
                client_id,
                previous.id
            );
        } else {
            tracing::debug!("Opened session {} for client {}", id, client_id);
        }

        (id, receiver)
    }

    /// Close a session; a newer session for the same client is left alone
    pub fn close(&self, client_id: &str, session_id: u64) -> bool {
        self.sessions
            .remove_if(client_id, |_, session| session.id == session_id)
            .is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry for SessionRegistry {
    fn connected_clients(&self) -> Vec<ClientId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    fn send(&self, client_id: &str, payload: Vec<u8>) -> Result<(), SyncError> {
        let session = self
            .sessions
            .get(client_id)
            .ok_or_else(|| SyncError::SendFailure(format!("client {} not connected", client_id)))?;
        session
            .sender
            .try_send(payload)
            .map_err(|e| SyncError::SendFailure(e.to_string()))
    }
}
