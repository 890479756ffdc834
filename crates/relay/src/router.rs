//! Relay routing between the time authority and follower nodes
//!
//! Routing looks only at who sent a message:
//! - from the designated authority: fanned out verbatim to every other node
//! - from anyone else: forwarded to the authority only
//!
//! The authority is designated by an operator. There is no failover; if the
//! authority is unreachable, sync stalls until someone reassigns it.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use timesync_timing::{NodeId, SyncError, SyncMessage};
use tokio::sync::mpsc;

/// Transport endpoint of a connected node
pub trait PeerSink: Send + Sync {
    /// Non-blocking delivery; a full or closed endpoint is a send failure
    fn deliver(&self, payload: Vec<u8>) -> Result<(), SyncError>;
}

impl PeerSink for mpsc::Sender<Vec<u8>> {
    fn deliver(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        self.try_send(payload)
            .map_err(|e| SyncError::SendFailure(e.to_string()))
    }
}

/// What happened to a routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Authority traffic copied to the other nodes
    FannedOut { delivered: usize, failed: usize },
    /// Follower traffic handed to the authority
    ToAuthority,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    NoAuthority,
    AuthorityUnreachable,
}

/// Stats about the relay
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub authority: Option<NodeId>,
    pub connected_peers: usize,
    pub fanned_out: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub heartbeats: u64,
}

struct PeerRoute {
    connection: u64,
    sink: Arc<dyn PeerSink>,
    connected_at_ms: i64,
}

/// Route table plus the designated authority
pub struct RelayRouter {
    peers: DashMap<NodeId, PeerRoute>,
    authority: RwLock<Option<Arc<str>>>,
    next_connection: AtomicU64,
    fanned_out: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    heartbeats: AtomicU64,
}

impl RelayRouter {
    /// Create a router with an optional initial authority
    pub fn new(authority: Option<&str>) -> Self {
        Self {
            peers: DashMap::new(),
            authority: RwLock::new(authority.map(Arc::from)),
            next_connection: AtomicU64::new(1),
            fanned_out: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
        }
    }

    /// Add or replace a node's endpoint; returns the connection id
    pub fn register_peer(&self, node_id: &str, sink: Arc<dyn PeerSink>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let route = PeerRoute {
            connection,
            sink,
            connected_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        if self.peers.insert(node_id.to_string(), route).is_some() {
            tracing::warn!("Node {} reconnected - replacing previous route", node_id);
        } else {
            tracing::info!("Node {} registered with relay", node_id);
        }
        connection
    }

    /// Remove a node's endpoint if it still belongs to `connection`
    pub fn unregister_peer(&self, node_id: &str, connection: u64) -> bool {
        let removed = self
            .peers
            .remove_if(node_id, |_, route| route.connection == connection)
            .is_some();
        if removed {
            tracing::info!("Node {} left the relay", node_id);
        }
        removed
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Connected node ids with their connect time, sorted by id
    pub fn peers(&self) -> Vec<(NodeId, i64)> {
        let mut peers: Vec<(NodeId, i64)> = self
            .peers
            .iter()
            .map(|r| (r.key().clone(), r.value().connected_at_ms))
            .collect();
        peers.sort();
        peers
    }

    /// Current authority id
    pub fn authority(&self) -> Option<NodeId> {
        self.authority.read().as_deref().map(str::to_string)
    }

    /// Designate a new authority; returns the previous one
    pub fn set_authority(&self, node_id: &str) -> Option<NodeId> {
        let previous = self.authority.write().replace(Arc::from(node_id));
        tracing::info!("Time authority changed to: {}", node_id);
        if !self.is_connected(node_id) {
            tracing::warn!("New time authority {} is not connected yet", node_id);
        }
        previous.map(|id| id.to_string())
    }

    /// Route one message from `sender`
    pub fn route(&self, sender: &str, payload: &[u8]) -> RouteOutcome {
        let message = match SyncMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping message from {}: {}", sender, e);
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
        };

        let authority = self.authority.read().clone();
        let Some(authority) = authority else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("No time authority designated - dropping {} from {}", message.kind(), sender);
            return RouteOutcome::Dropped(DropReason::NoAuthority);
        };

        if sender == &*authority {
            let mut delivered = 0;
            let mut failed = 0;
            for peer in self.peers.iter() {
                if peer.key() == sender {
                    continue;
                }
                match peer.value().sink.deliver(payload.to_vec()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::debug!("Failed to forward {} to {}: {}", message.kind(), peer.key(), e);
                    }
                }
            }
            self.fanned_out.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Fanned out {} to {} nodes", message.kind(), delivered);
            return RouteOutcome::FannedOut { delivered, failed };
        }

        let delivered = match self.peers.get(&*authority) {
            Some(peer) => peer.value().sink.deliver(payload.to_vec()).is_ok(),
            None => false,
        };
        if delivered {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Forwarded {} from {} to {}", message.kind(), sender, authority);
            RouteOutcome::ToAuthority
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Time authority {} unreachable - dropping {} from {}", authority, message.kind(), sender);
            RouteOutcome::Dropped(DropReason::AuthorityUnreachable)
        }
    }

    /// Nudge the authority to re-broadcast its time
    pub fn heartbeat(&self) -> bool {
        let Some(authority) = self.authority.read().clone() else {
            return false;
        };
        let payload = match SyncMessage::Heartbeat.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode heartbeat: {}", e);
                return false;
            }
        };
        let sent = self
            .peers
            .get(&*authority)
            .map(|peer| peer.value().sink.deliver(payload).is_ok())
            .unwrap_or(false);
        if sent {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Get current stats
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            authority: self.authority(),
            connected_peers: self.peers.len(),
            fanned_out: self.fanned_out.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(router: &RelayRouter, id: &str) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = router.register_peer(id, Arc::new(tx));
        (connection, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(SyncMessage::from_bytes(&bytes).unwrap());
        }
        out
    }

    #[test]
    fn test_authority_traffic_fans_out_except_sender() {
        let router = RelayRouter::new(Some("hub"));
        let (_, mut hub) = peer(&router, "hub");
        let (_, mut lobby) = peer(&router, "lobby");
        let (_, mut survival) = peer(&router, "survival");

        let update = SyncMessage::MasterTimeUpdate {
            master_time_ms: 1_000_000,
        };
        let outcome = router.route("hub", &update.to_bytes().unwrap());

        assert_eq!(outcome, RouteOutcome::FannedOut { delivered: 2, failed: 0 });
        assert_eq!(drain(&mut lobby), vec![update.clone()]);
        assert_eq!(drain(&mut survival), vec![update]);
        assert!(drain(&mut hub).is_empty());
    }

    #[test]
    fn test_follower_traffic_goes_only_to_authority() {
        let router = RelayRouter::new(Some("hub"));
        let (_, mut hub) = peer(&router, "hub");
        let (_, mut lobby) = peer(&router, "lobby");
        let (_, mut survival) = peer(&router, "survival");

        let request = SyncMessage::TimeRequest {
            sender_id: "lobby".to_string(),
            local_time_ms: 500,
        };
        let outcome = router.route("lobby", &request.to_bytes().unwrap());

        assert_eq!(outcome, RouteOutcome::ToAuthority);
        assert_eq!(drain(&mut hub), vec![request]);
        assert!(drain(&mut lobby).is_empty());
        assert!(drain(&mut survival).is_empty());
    }

    #[test]
    fn test_garbage_is_dropped_without_state_change() {
        let router = RelayRouter::new(Some("hub"));
        let (_, mut hub) = peer(&router, "hub");
        let (_, _lobby) = peer(&router, "lobby");

        let outcome = router.route("lobby", &[7, 7, 7]);
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::Malformed));
        assert_eq!(router.authority().as_deref(), Some("hub"));
        assert_eq!(router.peers().len(), 2);
        assert!(drain(&mut hub).is_empty());
        assert_eq!(router.stats().malformed, 1);
    }

    #[test]
    fn test_no_authority_and_unreachable_authority_stall() {
        let router = RelayRouter::new(None);
        let (_, _lobby) = peer(&router, "lobby");
        let request = SyncMessage::TimeRequest {
            sender_id: "lobby".to_string(),
            local_time_ms: 500,
        }
        .to_bytes()
        .unwrap();

        assert_eq!(
            router.route("lobby", &request),
            RouteOutcome::Dropped(DropReason::NoAuthority)
        );

        router.set_authority("hub");
        assert_eq!(
            router.route("lobby", &request),
            RouteOutcome::Dropped(DropReason::AuthorityUnreachable)
        );
        assert_eq!(router.authority().as_deref(), Some("hub"));
    }

    #[test]
    fn test_reassignment_changes_routing() {
        let router = RelayRouter::new(Some("hub"));
        let (_, mut hub) = peer(&router, "hub");
        let (_, mut lobby) = peer(&router, "lobby");

        assert_eq!(router.set_authority("lobby").as_deref(), Some("hub"));

        let update = SyncMessage::MasterTimeUpdate { master_time_ms: 42 };
        router.route("lobby", &update.to_bytes().unwrap());
        assert_eq!(drain(&mut hub), vec![update]);
        assert!(drain(&mut lobby).is_empty());
    }

    #[test]
    fn test_heartbeat_reaches_authority_only() {
        let router = RelayRouter::new(Some("hub"));
        let (_, mut hub) = peer(&router, "hub");
        let (_, mut lobby) = peer(&router, "lobby");

        assert!(router.heartbeat());
        assert_eq!(drain(&mut hub), vec![SyncMessage::Heartbeat]);
        assert!(drain(&mut lobby).is_empty());
        assert_eq!(router.stats().heartbeats, 1);
    }

    #[test]
    fn test_stale_connection_does_not_unregister_replacement() {
        let router = RelayRouter::new(None);
        let (old, _old_rx) = peer(&router, "lobby");
        let (new, _new_rx) = peer(&router, "lobby");

        assert!(!router.unregister_peer("lobby", old));
        assert!(router.is_connected("lobby"));
        assert!(router.unregister_peer("lobby", new));
        assert!(!router.is_connected("lobby"));
    }

    #[test]
    fn test_full_peer_counts_as_failed() {
        let router = RelayRouter::new(Some("hub"));
        let (_, _hub) = peer(&router, "hub");
        let (tx, _rx) = mpsc::channel(1);
        router.register_peer("lobby", Arc::new(tx));

        let update = SyncMessage::MasterTimeUpdate { master_time_ms: 1 }
            .to_bytes()
            .unwrap();
        assert_eq!(
            router.route("hub", &update),
            RouteOutcome::FannedOut { delivered: 1, failed: 0 }
        );
        assert_eq!(
            router.route("hub", &update),
            RouteOutcome::FannedOut { delivered: 0, failed: 1 }
        );
    }
}
