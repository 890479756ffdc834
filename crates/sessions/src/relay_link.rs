//! Node-side connection to the relay
//!
//! [`RelayLink`] is the node's [`NetworkLink`]. While connected, outbound
//! messages are queued for the socket's send task; while disconnected they
//! fail fast and the connect loop retries at a fixed delay.

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use timesync_timing::{handshake, ClockAuthority, NetworkLink, NodeId, SyncError};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Outbound queue depth towards the relay
pub const RELAY_QUEUE_DEPTH: usize = 256;

/// Default wait between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Outbound link from this node to the relay
pub struct RelayLink {
    node_id: NodeId,
    sender: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    connections: AtomicU64,
}

impl RelayLink {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            sender: RwLock::new(None),
            connections: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender
            .read()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Number of successful connections so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Keep a connection to `relay_addr` open, feeding inbound traffic to `authority`
    pub fn spawn(
        self: &Arc<Self>,
        relay_addr: &str,
        authority: Arc<ClockAuthority>,
        reconnect_delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let link = self.clone();
        let url = format!("ws://{}", relay_addr);
        tokio::spawn(async move {
            loop {
                match link.run_connection(&url, &authority).await {
                    Ok(()) => tracing::warn!("Relay closed connection"),
                    Err(e) => tracing::warn!("Relay connection to {} failed: {}", url, e),
                }
                link.sender.write().take();
                tokio::time::sleep(reconnect_delay).await;
            }
        })
    }

    async fn run_connection(&self, url: &str, authority: &ClockAuthority) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        ws_sender
            .send(Message::Text(handshake(&self.node_id)))
            .await?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(RELAY_QUEUE_DEPTH);
        *self.sender.write() = Some(tx);
        self.connections.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Connected to relay at {} as {}", url, self.node_id);

        let send_task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if ws_sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => authority.handle_message(&data),
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(_)) => {}
            }
        };

        send_task.abort();
        result
    }
}

impl NetworkLink for RelayLink {
    fn send(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        match self.sender.read().as_ref() {
            Some(tx) => tx
                .try_send(payload)
                .map_err(|e| SyncError::SendFailure(e.to_string())),
            None => Err(SyncError::SendFailure("not connected to relay".to_string())),
        }
    }
}
