//! WebSocket endpoint for game clients
//!
//! A client may open with a handshake text frame naming itself; otherwise it
//! gets a random anonymous id. Binary frames are sync messages handed to the
//! node's [`ClockAuthority`].

use crate::registry::SessionRegistry;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use timesync_timing::{parse_handshake, ClientId, ClockAuthority};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// How long to wait for a client to name itself
pub const CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client-facing WebSocket server
pub struct ClientServer {
    authority: Arc<ClockAuthority>,
    sessions: Arc<SessionRegistry>,
}

impl ClientServer {
    pub fn new(authority: Arc<ClockAuthority>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            authority,
            sessions,
        }
    }

    /// Start accepting clients; returns the bound address
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Client endpoint listening on {}", local_addr);

        let authority = self.authority.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer_addr)) = listener.accept().await {
                let authority = authority.clone();
                let sessions = sessions.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, authority, sessions).await {
                        tracing::warn!("Client connection error from {}: {}", peer_addr, e);
                    }
                });
            }
        });

        Ok(local_addr)
    }
}

/// Random id for clients that skip the handshake
pub fn anonymous_client_id() -> ClientId {
    format!("anon-{:016x}", rand::thread_rng().gen::<u64>())
}

async fn handle_client(
    stream: TcpStream,
    authority: Arc<ClockAuthority>,
    sessions: Arc<SessionRegistry>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut first_payload = None;
    let client_id = match tokio::time::timeout(CLIENT_HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match parse_handshake(&text) {
            Some(id) => id.to_string(),
            None => {
                tracing::debug!("Ignoring invalid client handshake {:?}", text);
                anonymous_client_id()
            }
        },
        Ok(Some(Ok(Message::Binary(data)))) => {
            first_payload = Some(data);
            anonymous_client_id()
        }
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
        Ok(Some(Ok(_))) | Err(_) => anonymous_client_id(),
        Ok(Some(Err(e))) => return Err(e.into()),
    };

    let (session, mut rx) = sessions.open(&client_id);
    tracing::info!("Client {} connected", client_id);

    let send_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                return;
            }
        }
        // Session replaced by a newer connection with the same id
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    if let Some(data) = first_payload {
        authority.handle_client_message(&client_id, &data);
    }

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => authority.handle_client_message(&client_id, &data),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("Client {} read error: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    send_task.abort();
    if sessions.close(&client_id, session) {
        authority.client_disconnected(&client_id);
    }
    tracing::info!("Client {} disconnected", client_id);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timesync_timing::{
        handshake, AuthoritySlot, ClientRegistry, ManualClock, SharedConfig, SyncConfig,
        SyncMessage,
    };
    use tokio_tungstenite::connect_async;

    fn node(sessions: &Arc<SessionRegistry>, clock: &Arc<ManualClock>) -> Arc<ClockAuthority> {
        let config = SyncConfig {
            is_time_authority: true,
            ..SyncConfig::default()
        };
        ClockAuthority::builder("lobby", Arc::new(SharedConfig::loaded(config)))
            .clock(clock.clone())
            .clients(sessions.clone())
            .build_in(&AuthoritySlot::new())
            .unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_anonymous_ids_are_valid_sender_ids() {
        let id = anonymous_client_id();
        assert!(timesync_timing::is_valid_sender_id(&id));
        assert_ne!(id, anonymous_client_id());
    }

    #[tokio::test]
    async fn test_client_receives_time_push_and_is_tracked() {
        let sessions = Arc::new(SessionRegistry::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let authority = node(&sessions, &clock);
        let server = ClientServer::new(authority.clone(), sessions.clone());
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        client.send(Message::Text(handshake("player-1"))).await.unwrap();
        wait_until(|| sessions.contains("player-1")).await;

        authority.tick(10_000);
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let pushed = match frame {
            Message::Binary(data) => SyncMessage::from_bytes(&data).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(pushed, SyncMessage::MasterTimeUpdate { master_time_ms: 10_000 });

        clock.set(10_040);
        let echo = SyncMessage::TimeResponse {
            sender_id: "player-1".to_string(),
            master_time_ms: 9_900,
            original_request_time_ms: 10_000,
        };
        client
            .send(Message::Binary(echo.to_bytes().unwrap()))
            .await
            .unwrap();
        wait_until(|| authority.client_sync().get("player-1").is_some()).await;

        let record = authority.client_sync().get("player-1").unwrap();
        assert_eq!(record.last_rtt_ms, 40);
        assert_eq!(record.offset_ms, 10_000 + 20 - 9_900);

        client.close(None).await.unwrap();
        wait_until(|| sessions.is_empty()).await;
        wait_until(|| authority.client_sync().get("player-1").is_none()).await;
        assert!(sessions.connected_clients().is_empty());
    }
}
