//! Clock authority - per-node time state machine
//!
//! Every node in the cluster owns exactly one [`ClockAuthority`]. The host
//! calls [`ClockAuthority::tick`] once per simulation cycle and feeds inbound
//! relay traffic to [`ClockAuthority::handle_message`], possibly from another
//! thread. Each shared field is its own atomic: readers may see a new offset
//! before the matching `last_successful_sync_ms`, which is fine.

use crate::client_sync::ClientSyncTracker;
use crate::config::{ConfigProvider, SyncConfig};
use crate::error::{Result, SyncError};
use crate::smooth_offset;
use crate::transport::{
    ClientRegistry, DisconnectedLink, NetworkLink, NoClients, SystemClock, WallClock,
};
use crate::types::{ClientId, ClockRole, ClockStats, NodeId, NodeRole, SyncMessage};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Guard that allows a single [`ClockAuthority`] to be built against it
#[derive(Debug, Default)]
pub struct AuthoritySlot {
    claimed: AtomicBool,
}

static PROCESS_SLOT: AuthoritySlot = AuthoritySlot::new();

impl AuthoritySlot {
    pub const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
        }
    }

    /// The slot shared by the whole process
    pub fn process() -> &'static AuthoritySlot {
        &PROCESS_SLOT
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<()> {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| SyncError::DuplicateInitialization)
    }
}

/// Per-node clock state machine
pub struct ClockAuthority {
    node_id: NodeId,
    /// Latest local wall-clock sample
    master_time_ms: AtomicI64,
    role: AtomicU8,
    /// Follower-only correction towards authority time
    network_offset_ms: AtomicI64,
    last_successful_sync_ms: AtomicI64,
    last_client_broadcast_ms: AtomicI64,
    last_network_sync_ms: AtomicI64,
    /// Clients still owed this round's time push
    pending_clients: Mutex<VecDeque<ClientId>>,
    client_sync: ClientSyncTracker,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn WallClock>,
    network: Arc<dyn NetworkLink>,
    clients: Arc<dyn ClientRegistry>,
    time_broadcasts: AtomicU64,
    client_updates_sent: AtomicU64,
    time_requests_sent: AtomicU64,
    drift_reports_sent: AtomicU64,
    send_failures: AtomicU64,
    malformed_received: AtomicU64,
}

impl ClockAuthority {
    /// Start building the authority for `node_id`
    pub fn builder(
        node_id: impl Into<NodeId>,
        config: Arc<dyn ConfigProvider>,
    ) -> ClockAuthorityBuilder {
        ClockAuthorityBuilder::new(node_id, config)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current cluster time in milliseconds
    ///
    /// Authority nodes return their own sample; followers add the smoothed
    /// network offset.
    pub fn get_current_time(&self) -> i64 {
        self.master_time_ms
            .load(Ordering::SeqCst)
            .saturating_add(self.network_offset_ms.load(Ordering::SeqCst))
    }

    pub fn role(&self) -> ClockRole {
        ClockRole::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub fn is_time_authority(&self) -> bool {
        self.role() == ClockRole::Authority
    }

    pub fn master_time_ms(&self) -> i64 {
        self.master_time_ms.load(Ordering::SeqCst)
    }

    pub fn network_offset_ms(&self) -> i64 {
        self.network_offset_ms.load(Ordering::SeqCst)
    }

    pub fn last_successful_sync_ms(&self) -> i64 {
        self.last_successful_sync_ms.load(Ordering::SeqCst)
    }

    /// Per-client sync records owned by this node
    pub fn client_sync(&self) -> &ClientSyncTracker {
        &self.client_sync
    }

    /// Run one simulation cycle
    ///
    /// No-op until configuration is available. The first cycle with
    /// configuration applies the configured role.
    pub fn tick(&self, now_ms: i64) {
        let config = match self.config.snapshot() {
            Ok(config) => config,
            Err(e) => {
                tracing::trace!("Skipping sync cycle: {}", e);
                return;
            }
        };

        self.master_time_ms.store(now_ms, Ordering::SeqCst);

        if self.role() == ClockRole::Uninitialized {
            self.apply_config(&config);
        }

        self.sync_clients(now_ms, &config);

        if self.role() == ClockRole::Follower
            && now_ms.saturating_sub(self.last_network_sync_ms.load(Ordering::SeqCst))
                >= config.network_sync_interval_ms
        {
            self.last_network_sync_ms.store(now_ms, Ordering::SeqCst);
            self.request_network_time();
        }
    }

    /// Apply a (re)loaded configuration
    ///
    /// Only the role and client limits change; intervals are read from the
    /// provider every cycle.
    pub fn apply_config(&self, config: &SyncConfig) -> bool {
        self.client_sync
            .set_limits(config.max_clients, config.stale_client_timeout_ms);
        let changed = self.set_role(NodeRole::from_authority_flag(config.is_time_authority));
        tracing::info!(
            "Applied time sync config: authority={} (role {})",
            config.is_time_authority,
            if changed { "changed" } else { "unchanged" }
        );
        changed
    }

    /// Switch role; returns false if the node already had `new_role`
    pub fn set_role(&self, new_role: NodeRole) -> bool {
        let target = ClockRole::from(new_role);
        let previous = ClockRole::from_u8(self.role.swap(target.to_u8(), Ordering::SeqCst));
        if previous == target {
            return false;
        }

        match new_role {
            NodeRole::Authority => {
                self.network_offset_ms.store(0, Ordering::SeqCst);
                tracing::info!("Node {} is now the time authority", self.node_id);
                self.broadcast_network_time();
            }
            NodeRole::Follower if previous == ClockRole::Authority => {
                tracing::info!("Node {} is no longer the time authority", self.node_id);
                self.request_network_time();
            }
            NodeRole::Follower => {
                tracing::info!("Node {} is following the time authority", self.node_id);
            }
        }
        true
    }

    /// Smooth a master time observation into the network offset
    pub fn handle_master_time_update(&self, remote_master_time_ms: i64) {
        if self.is_time_authority() {
            tracing::debug!("Ignoring master time update as we are the authority");
            return;
        }

        let local_sample = self.master_time_ms.load(Ordering::SeqCst);
        let raw_offset = remote_master_time_ms.saturating_sub(local_sample);

        let previous = match self.network_offset_ms.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |current| Some(smooth_offset(current, raw_offset)),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        let smoothed = smooth_offset(previous, raw_offset);

        // A role switch may have landed between the check above and the store.
        if self.is_time_authority() {
            self.network_offset_ms.store(0, Ordering::SeqCst);
            return;
        }

        self.last_successful_sync_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);

        let drift = smoothed.saturating_sub(previous);
        match self.config.snapshot() {
            Ok(config) if drift.saturating_abs() > config.max_drift_ms => {
                tracing::warn!("High network time drift detected: {}ms", drift);
                self.report_drift(drift);
            }
            _ => {
                tracing::debug!("Time sync successful: offset={}ms", smoothed);
            }
        }
    }

    /// Apply an answer to one of our time requests
    ///
    /// Late answers are still used: the embedded request time keeps the
    /// latency estimate honest.
    pub fn handle_time_response(&self, master_time_ms: i64, original_request_time_ms: i64) {
        if self.is_time_authority() {
            tracing::debug!("Ignoring time response as we are the authority");
            return;
        }

        let round_trip_ms = self.clock.now_ms().saturating_sub(original_request_time_ms);
        let one_way_latency_ms = round_trip_ms / 2;
        tracing::debug!(
            "Time response received: rtt={}ms, latency={}ms",
            round_trip_ms,
            one_way_latency_ms
        );
        self.handle_master_time_update(master_time_ms.saturating_add(one_way_latency_ms));
    }

    /// Entry point for traffic arriving from the relay
    pub fn handle_message(&self, payload: &[u8]) {
        let message = match SyncMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_received.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping relay message ({} bytes): {}", payload.len(), e);
                return;
            }
        };

        tracing::trace!("Relay message: {}", message.kind());

        match message {
            SyncMessage::MasterTimeUpdate { master_time_ms } => {
                self.handle_master_time_update(master_time_ms);
            }
            SyncMessage::TimeRequest {
                sender_id,
                local_time_ms,
            } => {
                if self.is_time_authority() {
                    self.answer_time_request(&sender_id, local_time_ms);
                } else {
                    tracing::debug!("Ignoring time request from {} - not the authority", sender_id);
                }
            }
            SyncMessage::TimeResponse {
                sender_id,
                master_time_ms,
                original_request_time_ms,
            } => {
                if sender_id == self.node_id {
                    self.handle_time_response(master_time_ms, original_request_time_ms);
                } else {
                    tracing::trace!("Skipping time response addressed to {}", sender_id);
                }
            }
            SyncMessage::DriftReport {
                sender_id,
                local_time_ms,
                estimated_master_time_ms,
                drift_ms,
            } => {
                if self.is_time_authority() {
                    tracing::warn!(
                        "Drift report from {}: localTime={}, estimatedMasterTime={}, drift={}ms",
                        sender_id,
                        local_time_ms,
                        estimated_master_time_ms,
                        drift_ms
                    );
                }
            }
            SyncMessage::Heartbeat => {
                if self.is_time_authority() {
                    self.broadcast_network_time();
                }
            }
        }
    }

    /// Entry point for traffic arriving from one of this node's clients
    ///
    /// Clients echo each time push back as a `TimeResponse` carrying their own
    /// clock reading, which yields a round trip and offset sample.
    pub fn handle_client_message(&self, client_id: &str, payload: &[u8]) {
        let message = match SyncMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                self.malformed_received.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping message from client {}: {}", client_id, e);
                return;
            }
        };

        match message {
            SyncMessage::TimeResponse {
                master_time_ms: client_time_ms,
                original_request_time_ms: pushed_time_ms,
                ..
            } => {
                // Echoed fields are client-controlled; saturate rather than overflow.
                let now = self.clock.now_ms().saturating_add(self.network_offset_ms());
                let rtt_ms = now.saturating_sub(pushed_time_ms).max(0);
                let offset_ms = pushed_time_ms
                    .saturating_add(rtt_ms / 2)
                    .saturating_sub(client_time_ms);
                self.client_sync.update_sync(client_id, offset_ms, rtt_ms);
            }
            SyncMessage::TimeRequest { local_time_ms, .. } => {
                let response = SyncMessage::TimeResponse {
                    sender_id: client_id.to_string(),
                    master_time_ms: self.get_current_time(),
                    original_request_time_ms: local_time_ms,
                };
                match response.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.clients.send(client_id, bytes) {
                            self.send_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("Dropped time response to client {}: {}", client_id, e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to encode time response for {}: {}", client_id, e);
                    }
                }
            }
            other => {
                tracing::debug!("Ignoring {} from client {}", other.kind(), client_id);
            }
        }
    }

    /// Forget a disconnected client
    pub fn client_disconnected(&self, client_id: &str) {
        self.client_sync.remove(client_id);
        self.pending_clients.lock().retain(|pending| pending != client_id);
    }

    /// Get current stats
    pub fn stats(&self) -> ClockStats {
        ClockStats {
            node_id: self.node_id.clone(),
            role: self.role(),
            current_time_ms: self.get_current_time(),
            network_offset_ms: self.network_offset_ms(),
            last_successful_sync_ms: self.last_successful_sync_ms(),
            tracked_clients: self.client_sync.len(),
            deferred_clients: self.pending_clients.lock().len(),
            time_broadcasts: self.time_broadcasts.load(Ordering::Relaxed),
            client_updates_sent: self.client_updates_sent.load(Ordering::Relaxed),
            time_requests_sent: self.time_requests_sent.load(Ordering::Relaxed),
            drift_reports_sent: self.drift_reports_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            malformed_received: self.malformed_received.load(Ordering::Relaxed),
        }
    }

    /// Push the current time to connected clients, within the cycle budget
    fn sync_clients(&self, now_ms: i64, config: &SyncConfig) {
        // The queue lock is only ever held for a single push or pop, so
        // disconnects and stats readers on I/O tasks never wait on a send.
        if self.pending_clients.lock().is_empty() {
            if now_ms.saturating_sub(self.last_client_broadcast_ms.load(Ordering::SeqCst))
                < config.client_sync_interval_ms
            {
                return;
            }
            self.last_client_broadcast_ms.store(now_ms, Ordering::SeqCst);

            let connected = self.clients.connected_clients();
            let connected_set: HashSet<ClientId> = connected.iter().cloned().collect();
            self.client_sync
                .prune_stale(config.stale_client_timeout_ms, &connected_set);
            if connected.is_empty() {
                return;
            }
            self.pending_clients.lock().extend(connected);
        }

        let update = SyncMessage::MasterTimeUpdate {
            master_time_ms: self.get_current_time(),
        };
        let payload = match update.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode client time update: {}", e);
                self.pending_clients.lock().clear();
                return;
            }
        };

        let budget = Duration::from_millis(config.client_broadcast_budget_ms);
        let started = Instant::now();
        let mut served = 0usize;

        loop {
            // Always serve at least one client so deferred ones make progress.
            if served > 0 && started.elapsed() > budget {
                let deferred = self.pending_clients.lock().len();
                if deferred > 0 {
                    tracing::warn!(
                        "Time sync taking too long - deferring {} clients to next cycle",
                        deferred
                    );
                }
                break;
            }
            let next = self.pending_clients.lock().pop_front();
            let Some(client_id) = next else {
                break;
            };

            match self.clients.send(&client_id, payload.clone()) {
                Ok(()) => {
                    self.client_updates_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.send_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Failed to sync time with client {}: {}", client_id, e);
                }
            }
            served += 1;
        }
    }

    fn broadcast_network_time(&self) {
        if !self.is_time_authority() {
            return;
        }
        let update = SyncMessage::MasterTimeUpdate {
            master_time_ms: self.get_current_time(),
        };
        if self.send_to_network(&update) {
            self.time_broadcasts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Broadcast network time: {}", self.get_current_time());
        }
    }

    fn request_network_time(&self) {
        if self.is_time_authority() {
            return;
        }
        let request = SyncMessage::TimeRequest {
            sender_id: self.node_id.clone(),
            local_time_ms: self.clock.now_ms(),
        };
        if self.send_to_network(&request) {
            self.time_requests_sent.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Requested network time sync");
        }
    }

    fn answer_time_request(&self, requester: &str, request_time_ms: i64) {
        let response = SyncMessage::TimeResponse {
            sender_id: requester.to_string(),
            master_time_ms: self.get_current_time(),
            original_request_time_ms: request_time_ms,
        };
        if self.send_to_network(&response) {
            tracing::debug!("Sent time response to {}", requester);
        }
    }

    fn report_drift(&self, drift_ms: i64) {
        let report = SyncMessage::DriftReport {
            sender_id: self.node_id.clone(),
            local_time_ms: self.master_time_ms(),
            estimated_master_time_ms: self.get_current_time(),
            drift_ms,
        };
        if self.send_to_network(&report) {
            self.drift_reports_sent.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Reported time drift of {}ms", drift_ms);
        }
    }

    /// Encode and hand off to the relay link; failures are dropped
    fn send_to_network(&self, message: &SyncMessage) -> bool {
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode {}: {}", message.kind(), e);
                return false;
            }
        };
        match self.network.send(payload) {
            Ok(()) => true,
            Err(e) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropped {}: {}", message.kind(), e);
                false
            }
        }
    }
}

/// Builder for ClockAuthority
pub struct ClockAuthorityBuilder {
    node_id: NodeId,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn WallClock>,
    network: Arc<dyn NetworkLink>,
    clients: Arc<dyn ClientRegistry>,
}

impl ClockAuthorityBuilder {
    pub fn new(node_id: impl Into<NodeId>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            clock: Arc::new(SystemClock),
            network: Arc::new(DisconnectedLink),
            clients: Arc::new(NoClients),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkLink>) -> Self {
        self.network = network;
        self
    }

    pub fn clients(mut self, clients: Arc<dyn ClientRegistry>) -> Self {
        self.clients = clients;
        self
    }

    /// Build the process-wide authority; a second call fails
    pub fn build(self) -> Result<Arc<ClockAuthority>> {
        self.build_in(AuthoritySlot::process())
    }

    /// Build against a specific slot
    pub fn build_in(self, slot: &AuthoritySlot) -> Result<Arc<ClockAuthority>> {
        let id = self.node_id.trim();
        if id.is_empty() || self.node_id.len() > crate::codec::MAX_SENDER_ID_LEN {
            return Err(SyncError::InvalidConfig(format!(
                "node id {:?} must be 1..={} bytes",
                self.node_id,
                crate::codec::MAX_SENDER_ID_LEN
            )));
        }
        slot.claim()?;

        let now = self.clock.now_ms();
        let defaults = SyncConfig::default();
        let authority = ClockAuthority {
            node_id: self.node_id,
            master_time_ms: AtomicI64::new(now),
            role: AtomicU8::new(ClockRole::Uninitialized.to_u8()),
            network_offset_ms: AtomicI64::new(0),
            last_successful_sync_ms: AtomicI64::new(now),
            // Never synced: the first configured tick is due immediately.
            last_client_broadcast_ms: AtomicI64::new(i64::MIN),
            last_network_sync_ms: AtomicI64::new(i64::MIN),
            pending_clients: Mutex::new(VecDeque::new()),
            client_sync: ClientSyncTracker::new(
                self.clock.clone(),
                defaults.max_clients,
                defaults.stale_client_timeout_ms,
            ),
            config: self.config,
            clock: self.clock,
            network: self.network,
            clients: self.clients,
            time_broadcasts: AtomicU64::new(0),
            client_updates_sent: AtomicU64::new(0),
            time_requests_sent: AtomicU64::new(0),
            drift_reports_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            malformed_received: AtomicU64::new(0),
        };

        tracing::info!(
            "Clock authority for {} initialized with time: {}",
            authority.node_id,
            now
        );
        Ok(Arc::new(authority))
    }
}
