//! Node-side sessions: game clients on one side, the relay on the other
//!
//! - [`SessionRegistry`] tracks connected clients and implements the
//!   `ClientRegistry` seam of the clock authority
//! - [`ClientServer`] accepts client WebSocket connections
//! - [`RelayLink`] keeps the node connected to the relay

pub mod registry;
pub mod relay_link;
pub mod ws_server;

pub use registry::{SessionRegistry, CLIENT_QUEUE_DEPTH};
pub use relay_link::{RelayLink, RECONNECT_DELAY, RELAY_QUEUE_DEPTH};
pub use ws_server::{anonymous_client_id, ClientServer, CLIENT_HANDSHAKE_TIMEOUT};
