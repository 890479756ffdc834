//! Per-client offset and latency bookkeeping
//!
//! Records are created on the first sync contact from a client and removed
//! when the session layer reports a disconnect. Clients that vanish without a
//! disconnect are only pruned opportunistically, when a broadcast round starts
//! or when the tracker is full.

use crate::smooth_offset;
use crate::transport::WallClock;
use crate::types::ClientId;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

/// Sync state for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSyncRecord {
    pub client_id: ClientId,
    /// Smoothed difference between master time and the client's clock
    pub offset_ms: i64,
    /// Last measured round trip, unsmoothed
    pub last_rtt_ms: i64,
    /// Wall-clock time of the last update
    pub last_sync_ms: i64,
}

/// Thread-safe map of client sync records
///
/// Uses DashMap so session tasks can record samples while the cycle thread
/// iterates clients.
pub struct ClientSyncTracker {
    records: DashMap<ClientId, ClientSyncRecord>,
    clock: Arc<dyn WallClock>,
    max_clients: AtomicUsize,
    stale_after_ms: AtomicI64,
}

impl ClientSyncTracker {
    /// Create an empty tracker
    pub fn new(clock: Arc<dyn WallClock>, max_clients: usize, stale_after_ms: i64) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            max_clients: AtomicUsize::new(max_clients),
            stale_after_ms: AtomicI64::new(stale_after_ms),
        }
    }

    /// Adjust capacity and staleness after a config reload
    pub fn set_limits(&self, max_clients: usize, stale_after_ms: i64) {
        self.max_clients.store(max_clients, Ordering::Relaxed);
        self.stale_after_ms.store(stale_after_ms, Ordering::Relaxed);
    }

    /// Record a sync sample for a client
    ///
    /// The first sample is taken as-is; later offsets are smoothed and the
    /// round trip is replaced. Returns false if the tracker is full and the
    /// client could not be added.
    pub fn update_sync(&self, client_id: &str, offset_ms: i64, rtt_ms: i64) -> bool {
        let now = self.clock.now_ms();

        if let Some(mut record) = self.records.get_mut(client_id) {
            record.offset_ms = smooth_offset(record.offset_ms, offset_ms);
            record.last_rtt_ms = rtt_ms;
            record.last_sync_ms = now;
            return true;
        }

        let max_clients = self.max_clients.load(Ordering::Relaxed);
        if self.records.len() >= max_clients {
            let stale_after = self.stale_after_ms.load(Ordering::Relaxed);
            let pruned = self.prune_stale(stale_after, &HashSet::new());
            if self.records.len() >= max_clients {
                tracing::warn!(
                    "Client sync tracker full ({} clients, {} pruned) - not tracking {}",
                    max_clients,
                    pruned,
                    client_id
                );
                return false;
            }
        }

        self.records
            .entry(client_id.to_string())
            .and_modify(|record| {
                record.offset_ms = smooth_offset(record.offset_ms, offset_ms);
                record.last_rtt_ms = rtt_ms;
                record.last_sync_ms = now;
            })
            .or_insert_with(|| ClientSyncRecord {
                client_id: client_id.to_string(),
                offset_ms,
                last_rtt_ms: rtt_ms,
                last_sync_ms: now,
            });

        tracing::debug!("Tracking client {} (offset {}ms, rtt {}ms)", client_id, offset_ms, rtt_ms);
        true
    }

    /// Whether a client's data is older than `max_age_ms`; unknown clients are stale
    pub fn is_stale(&self, client_id: &str, max_age_ms: i64) -> bool {
        match self.records.get(client_id) {
            Some(record) => self.clock.now_ms().saturating_sub(record.last_sync_ms) > max_age_ms,
            None => true,
        }
    }

    /// Drop stale records whose client is not in `connected`
    pub fn prune_stale(&self, max_age_ms: i64, connected: &HashSet<ClientId>) -> usize {
        let now = self.clock.now_ms();
        let before = self.records.len();
        self.records.retain(|client_id, record| {
            connected.contains(client_id) || now.saturating_sub(record.last_sync_ms) <= max_age_ms
        });
        let pruned = before.saturating_sub(self.records.len());
        if pruned > 0 {
            tracing::debug!("Pruned {} stale client sync records", pruned);
        }
        pruned
    }

    /// Remove a client's record
    pub fn remove(&self, client_id: &str) -> Option<ClientSyncRecord> {
        self.records.remove(client_id).map(|(_, record)| record)
    }

    /// Get a copy of a client's record
    pub fn get(&self, client_id: &str) -> Option<ClientSyncRecord> {
        self.records.get(client_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
