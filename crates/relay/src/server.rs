//! WebSocket front end for the relay
//!
//! Nodes connect, send a handshake text frame naming themselves, then
//! exchange binary sync messages. Each connection gets a bounded outbound
//! queue drained by its own send task.

use crate::router::RelayRouter;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use timesync_timing::parse_handshake;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Outbound queue depth per connected node
pub const PEER_QUEUE_DEPTH: usize = 256;

/// How long a fresh connection may take to identify itself
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between authority heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Relay server (one per cluster)
pub struct RelayServer {
    router: Arc<RelayRouter>,
}

impl RelayServer {
    pub fn new(router: Arc<RelayRouter>) -> Self {
        Self { router }
    }

    /// Start listening for node connections; returns the bound address
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Relay listening on {}", local_addr);

        let router = self.router.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Connection from {}", peer_addr);
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_node_connection(stream, router).await {
                                tracing::warn!("Node connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Periodically ask the authority to re-broadcast its time
    pub fn spawn_heartbeat(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let router = self.router.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !router.heartbeat() {
                    tracing::trace!("Heartbeat skipped - authority not reachable");
                }
            }
        })
    }
}

async fn handle_node_connection(stream: TcpStream, router: Arc<RelayRouter>) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let node_id = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match parse_handshake(&text) {
            Some(id) => id.to_string(),
            None => anyhow::bail!("invalid handshake: {:?}", text),
        },
        Ok(Some(Ok(other))) => anyhow::bail!("expected handshake, got {:?}", other),
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Ok(()),
        Err(_) => anyhow::bail!("handshake timed out"),
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PEER_QUEUE_DEPTH);
    let connection = router.register_peer(&node_id, Arc::new(tx));

    // Forward routed traffic to this node
    let send_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                router.route(&node_id, &data);
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error from {}: {}", node_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    router.unregister_peer(&node_id, connection);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timesync_timing::{handshake, SyncMessage};
    use tokio_tungstenite::connect_async;

    async fn wait_for_peers(router: &RelayRouter, count: usize) {
        for _ in 0..100 {
            if router.peers().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} peers, have {:?}", count, router.peers());
    }

    #[tokio::test]
    async fn test_relay_fans_out_authority_updates() {
        let router = Arc::new(RelayRouter::new(Some("hub")));
        let server = RelayServer::new(router.clone());
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", addr);

        let (mut hub, _) = connect_async(&url).await.unwrap();
        hub.send(Message::Text(handshake("hub"))).await.unwrap();
        let (mut lobby, _) = connect_async(&url).await.unwrap();
        lobby.send(Message::Text(handshake("lobby"))).await.unwrap();
        wait_for_peers(&router, 2).await;

        let update = SyncMessage::MasterTimeUpdate {
            master_time_ms: 1_000_000,
        };
        hub.send(Message::Binary(update.to_bytes().unwrap()))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), lobby.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match received {
            Message::Binary(data) => assert_eq!(SyncMessage::from_bytes(&data).unwrap(), update),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_node() {
        let router = Arc::new(RelayRouter::new(None));
        let server = RelayServer::new(router.clone());
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let (mut lobby, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        lobby.send(Message::Text(handshake("lobby"))).await.unwrap();
        wait_for_peers(&router, 1).await;

        lobby.close(None).await.unwrap();
        wait_for_peers(&router, 0).await;
    }

    #[tokio::test]
    async fn test_bad_handshake_is_rejected() {
        let router = Arc::new(RelayRouter::new(None));
        let server = RelayServer::new(router.clone());
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let (mut peer, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        peer.send(Message::Text("hello".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(router.peers().is_empty());
    }
}
