//! Cluster time sync - leader/follower clock with drift smoothing
//!
//! Architecture:
//! - One authority node is ground truth for wall-clock time
//! - Followers request time through the relay and smooth answers into an offset
//! - Every node pushes its reconciled time to its own clients each sync interval
//! - Large offset jumps are reported back to the authority as drift

pub mod authority;
pub mod client_sync;
pub mod codec;
pub mod config;
pub mod error;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use authority::{AuthoritySlot, ClockAuthority, ClockAuthorityBuilder};
pub use client_sync::{ClientSyncRecord, ClientSyncTracker};
pub use codec::{
    handshake, is_valid_sender_id, parse_handshake, CHANNEL, MAX_MESSAGE_SIZE, MAX_SENDER_ID_LEN,
};
pub use config::{ConfigProvider, SharedConfig, SyncConfig};
pub use error::{EncodingLimit, Malformed, SyncError};
pub use transport::{
    ClientRegistry, DisconnectedLink, ManualClock, NetworkLink, NoClients, SystemClock, WallClock,
};
pub use types::*;

/// Simulation cycle length in milliseconds (20Hz)
pub const CYCLE_MS: u64 = 50;

/// Soft per-cycle budget for pushing time to clients
pub const CLIENT_BROADCAST_BUDGET_MS: u64 = 45;

/// Exponential moving average with alpha = 0.2
///
/// Integer arithmetic, truncating toward zero.
pub fn smooth_offset(previous_ms: i64, sample_ms: i64) -> i64 {
    ((previous_ms as i128 * 4 + sample_ms as i128) / 5) as i64
}
