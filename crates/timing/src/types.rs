//! Core types for time sync messages and node roles

use serde::Serialize;

/// Logical node identifier (the backend server name behind the relay)
pub type NodeId = String;

/// Connected client identifier
pub type ClientId = String;

/// Message types exchanged between nodes, the relay, and clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Authority publishing its current time
    MasterTimeUpdate { master_time_ms: i64 },

    /// Follower asking the authority for the current time
    TimeRequest { sender_id: String, local_time_ms: i64 },

    /// Authority answering a request
    ///
    /// `sender_id` is the requester being answered, so followers can skip
    /// responses addressed to someone else after the relay fans them out.
    TimeResponse {
        sender_id: String,
        master_time_ms: i64,
        original_request_time_ms: i64,
    },

    /// Follower reporting a large offset jump to the authority
    DriftReport {
        sender_id: String,
        local_time_ms: i64,
        estimated_master_time_ms: i64,
        drift_ms: i64,
    },

    /// Relay nudging the authority to re-broadcast
    Heartbeat,
}

impl SyncMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::MasterTimeUpdate { .. } => "master_time_update",
            SyncMessage::TimeRequest { .. } => "time_request",
            SyncMessage::TimeResponse { .. } => "time_response",
            SyncMessage::DriftReport { .. } => "drift_report",
            SyncMessage::Heartbeat => "heartbeat",
        }
    }
}

/// Role a node can be assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Derives its time from the authority through a smoothed offset
    Follower,
    /// Ground truth for the cluster
    Authority,
}

impl NodeRole {
    pub fn from_authority_flag(is_time_authority: bool) -> Self {
        if is_time_authority {
            NodeRole::Authority
        } else {
            NodeRole::Follower
        }
    }
}

/// Role state of a clock, including the pre-configuration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockRole {
    Uninitialized,
    Follower,
    Authority,
}

impl ClockRole {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ClockRole::Uninitialized => 0,
            ClockRole::Follower => 1,
            ClockRole::Authority => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ClockRole::Follower,
            2 => ClockRole::Authority,
            _ => ClockRole::Uninitialized,
        }
    }
}

impl From<NodeRole> for ClockRole {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Follower => ClockRole::Follower,
            NodeRole::Authority => ClockRole::Authority,
        }
    }
}

/// Point-in-time view of a clock authority
#[derive(Debug, Clone, Serialize)]
pub struct ClockStats {
    pub node_id: NodeId,
    pub role: ClockRole,
    pub current_time_ms: i64,
    pub network_offset_ms: i64,
    pub last_successful_sync_ms: i64,
    pub tracked_clients: usize,
    pub deferred_clients: usize,
    pub time_broadcasts: u64,
    pub client_updates_sent: u64,
    pub time_requests_sent: u64,
    pub drift_reports_sent: u64,
    pub send_failures: u64,
    pub malformed_received: u64,
}
