//! Relay tier for cluster time sync
//!
//! Every node keeps one WebSocket connection to the relay. Traffic from the
//! designated time authority is fanned out to all other nodes, everything
//! else goes to the authority. An operator moves the authority from the
//! admin console.

pub mod admin;
pub mod router;
pub mod server;

pub use admin::{execute, parse_command, spawn_console, AdminCommand};
pub use router::{DropReason, PeerSink, RelayRouter, RelayStats, RouteOutcome};
pub use server::{RelayServer, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, PEER_QUEUE_DEPTH};
