//! Behaviour tests for the clock authority, driven by a manual clock


use crate::config::{SharedConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::transport::{ClientRegistry, ManualClock, NetworkLink};
use crate::types::{ClientId, SyncMessage};
use crate::{AuthoritySlot, ClockAuthority};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Network link that records everything it is asked to send
#[derive(Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<SyncMessage>>,
    failing: AtomicBool,
}

impl RecordingLink {
    pub fn messages(&self) -> Vec<SyncMessage> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<SyncMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|m| m.kind() == kind).count()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl NetworkLink for RecordingLink {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::SendFailure("link down".to_string()));
        }
        let message = SyncMessage::from_bytes(&payload)?;
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Client registry with a fixed client list and an optional per-send delay
#[derive(Default)]
pub struct RecordingClients {
    connected: Mutex<Vec<ClientId>>,
    sent: Mutex<Vec<(ClientId, SyncMessage)>>,
    send_delay: Mutex<Option<Duration>>,
}

impl RecordingClients {
    pub fn connect(&self, client_id: &str) {
        self.connected.lock().push(client_id.to_string());
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub fn sent(&self) -> Vec<(ClientId, SyncMessage)> {
        self.sent.lock().clone()
    }
}

impl ClientRegistry for RecordingClients {
    fn connected_clients(&self) -> Vec<ClientId> {
        self.connected.lock().clone()
    }

    fn send(&self, client_id: &str, payload: Vec<u8>) -> Result<()> {
        if let Some(delay) = *self.send_delay.lock() {
            std::thread::sleep(delay);
        }
        let message = SyncMessage::from_bytes(&payload)?;
        self.sent.lock().push((client_id.to_string(), message));
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub config: Arc<SharedConfig>,
    pub link: Arc<RecordingLink>,
    pub clients: Arc<RecordingClients>,
    pub authority: Arc<ClockAuthority>,
}

pub fn harness(node_id: &str, config: Option<SyncConfig>, start_ms: i64) -> Harness {
    let clock = Arc::new(ManualClock::new(start_ms));
    let shared = Arc::new(match config {
        Some(config) => SharedConfig::loaded(config),
        None => SharedConfig::new(),
    });
    let link = Arc::new(RecordingLink::default());
    let clients = Arc::new(RecordingClients::default());

    let authority = ClockAuthority::builder(node_id, shared.clone())
        .clock(clock.clone())
        .network(link.clone())
        .clients(clients.clone())
        .build_in(&AuthoritySlot::new())
        .unwrap();

    Harness {
        clock,
        config: shared,
        link,
        clients,
        authority,
    }
}

pub fn follower_config() -> SyncConfig {
    SyncConfig::default()
}

pub fn authority_config() -> SyncConfig {
    SyncConfig {
        is_time_authority: true,
        ..SyncConfig::default()
    }
}
