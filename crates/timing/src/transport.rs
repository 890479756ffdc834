//! Seams to the host process: wall clock, outbound relay link, client sessions
//!
//! None of these may block. Implementations that cannot deliver right away
//! return [`SyncError::SendFailure`] and the message is dropped.

use crate::error::{Result, SyncError};
use crate::types::ClientId;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock milliseconds
pub trait WallClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Outbound path from a node to the relay
pub trait NetworkLink: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> Result<()>;
}

/// Link used before the relay connection exists
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedLink;

impl NetworkLink for DisconnectedLink {
    fn send(&self, _payload: Vec<u8>) -> Result<()> {
        Err(SyncError::SendFailure("no relay link".to_string()))
    }
}

/// Transport/session registry for a node's connected clients
pub trait ClientRegistry: Send + Sync {
    /// Ids of every currently connected client
    fn connected_clients(&self) -> Vec<ClientId>;

    /// Fire-and-forget delivery to one client
    fn send(&self, client_id: &str, payload: Vec<u8>) -> Result<()>;
}

/// Registry for nodes that host no clients
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClients;

impl ClientRegistry for NoClients {
    fn connected_clients(&self) -> Vec<ClientId> {
        Vec::new()
    }

    fn send(&self, client_id: &str, _payload: Vec<u8>) -> Result<()> {
        Err(SyncError::SendFailure(format!("unknown client {}", client_id)))
    }
}
