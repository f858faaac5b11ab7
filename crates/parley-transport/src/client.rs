//! Signaling client.
//!
//! [`SignalingClient`] waits for the relay's `welcome`, then hands the
//! connection to a background driver. The driver answers server pings, sends
//! its own pings on the same schedule as the relay, and tears the connection
//! down once the relay leaves `max_missed` of them unanswered.

use parley_protocol::{
    codec, Envelope, PeerId, RoomId, Version, WireFormat, PROTOCOL_VERSION,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::traits::{Connection, Inbound, TransportError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time between keep-alive pings when the relay's welcome does not
    /// announce an interval.
    pub heartbeat_interval: Duration,
    /// Unanswered pings before the connection is dropped.
    pub max_missed: u32,
    /// Encoding for outgoing envelopes.
    pub format: WireFormat,
    /// How long to wait for the relay's welcome.
    pub welcome_timeout: Duration,
    /// Envelopes buffered in each direction.
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed: 2,
            format: WireFormat::Json,
            welcome_timeout: Duration::from_secs(10),
            queue_capacity: 64,
        }
    }
}

/// A connected signaling client.
pub struct SignalingClient {
    peer_id: PeerId,
    server_version: Version,
    heartbeat_ms: u64,
    outgoing: mpsc::Sender<Envelope>,
    incoming: mpsc::Receiver<Envelope>,
    driver: JoinHandle<Result<(), TransportError>>,
}

impl SignalingClient {
    /// Connect to a relay over WebSocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, the welcome, or the version check fails.
    #[cfg(feature = "websocket")]
    pub async fn connect(url: &str, config: ClientConfig) -> Result<Self, TransportError> {
        let conn = crate::websocket::WebSocketConnection::connect(url).await?;
        Self::from_connection(Box::new(conn), config).await
    }

    /// Run the handshake over an existing connection.
    ///
    /// # Errors
    ///
    /// Returns an error if no welcome arrives in time, or if the relay speaks
    /// an incompatible protocol version.
    pub async fn from_connection(
        mut conn: Box<dyn Connection>,
        mut config: ClientConfig,
    ) -> Result<Self, TransportError> {
        let welcome = tokio::time::timeout(config.welcome_timeout, wait_for_welcome(conn.as_mut()))
            .await
            .map_err(|_| TransportError::Timeout)?;
        let (peer_id, server_version, heartbeat_ms) = match welcome {
            Ok(welcome) => welcome,
            Err(e) => {
                let _ = conn.close().await;
                return Err(e);
            }
        };

        if !server_version.is_compatible_with(&PROTOCOL_VERSION) {
            let _ = conn.close().await;
            return Err(TransportError::VersionMismatch {
                server: server_version,
                client: PROTOCOL_VERSION,
            });
        }

        config.heartbeat_interval = ping_interval(heartbeat_ms, config.heartbeat_interval);
        info!(
            peer = %peer_id,
            version = %server_version,
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            "Connected to relay"
        );

        let (outgoing, outgoing_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (incoming_tx, incoming) = mpsc::channel(config.queue_capacity.max(1));
        let driver = tokio::spawn(drive(conn, outgoing_rx, incoming_tx, config));

        Ok(Self {
            peer_id,
            server_version,
            heartbeat_ms,
            outgoing,
            incoming,
            driver,
        })
    }

    /// The id the relay assigned to this client.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Protocol version announced by the relay.
    #[must_use]
    pub fn server_version(&self) -> Version {
        self.server_version
    }

    /// The relay's ping interval, in milliseconds.
    #[must_use]
    pub fn heartbeat_ms(&self) -> u64 {
        self.heartbeat_ms
    }

    /// Send any envelope.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the driver has stopped.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outgoing
            .send(envelope)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Join a room, leaving the current one if any.
    pub async fn join(&self, room_id: impl Into<RoomId>) -> Result<(), TransportError> {
        self.send(Envelope::join(room_id)).await
    }

    /// Send an SDP offer or answer to one peer.
    pub async fn send_session_description(
        &self,
        peer_id: PeerId,
        desc: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.send(Envelope::session_description(peer_id, desc)).await
    }

    /// Send an ICE candidate to one peer.
    pub async fn send_ice_candidate(
        &self,
        peer_id: PeerId,
        candidate: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.send(Envelope::ice_candidate(peer_id, candidate)).await
    }

    /// Send a chat message to the whole room.
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(Envelope::chat(message)).await
    }

    /// Wait for the next envelope from the relay.
    ///
    /// Keep-alive traffic is handled by the driver and never shows up here.
    /// Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.incoming.recv().await
    }

    /// Close the connection and wait for the driver to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the driver, if any.
    pub async fn close(self) -> Result<(), TransportError> {
        let Self {
            outgoing,
            incoming,
            driver,
            ..
        } = self;
        drop(outgoing);
        drop(incoming);

        driver
            .await
            .map_err(|e| TransportError::Other(format!("Client driver failed: {e}")))?
    }
}

async fn wait_for_welcome(
    conn: &mut dyn Connection,
) -> Result<(PeerId, Version, u64), TransportError> {
    loop {
        match conn.recv().await? {
            Some(Inbound::Message(message)) => match codec::decode(&message)? {
                Envelope::Welcome {
                    peer_id,
                    version,
                    heartbeat_ms,
                } => return Ok((peer_id, version, heartbeat_ms)),
                other => debug!(kind = %other.kind(), "Ignoring envelope before welcome"),
            },
            Some(Inbound::Pong) => {}
            None => return Err(TransportError::ConnectionClosed),
        }
    }
}

/// Ping on the relay's announced interval, falling back to `configured`
/// when it announces none. Never zero.
fn ping_interval(heartbeat_ms: u64, configured: Duration) -> Duration {
    let interval = if heartbeat_ms > 0 {
        Duration::from_millis(heartbeat_ms)
    } else {
        configured
    };
    interval.max(Duration::from_millis(1))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn drive(
    mut conn: Box<dyn Connection>,
    mut outgoing: mpsc::Receiver<Envelope>,
    incoming: mpsc::Sender<Envelope>,
    config: ClientConfig,
) -> Result<(), TransportError> {
    let format = config.format;
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut missed = 0u32;

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if missed >= config.max_missed {
                    warn!(missed, "Relay stopped answering pings, closing");
                    break Err(TransportError::Timeout);
                }
                missed += 1;
                let ping = Envelope::Ping { timestamp: Some(now_millis()) };
                if let Err(e) = conn.send_envelope(&ping, format).await {
                    break Err(e);
                }
            }

            envelope = outgoing.recv() => {
                let Some(envelope) = envelope else {
                    // The client handle is gone.
                    break Ok(());
                };
                if let Err(e) = conn.send_envelope(&envelope, format).await {
                    break Err(e);
                }
            }

            inbound = conn.recv() => {
                let message = match inbound {
                    Ok(Some(Inbound::Message(message))) => message,
                    Ok(Some(Inbound::Pong)) => {
                        missed = 0;
                        continue;
                    }
                    Ok(None) => {
                        debug!("Relay closed the connection");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                };

                match codec::decode(&message) {
                    Ok(Envelope::Ping { timestamp }) => {
                        missed = 0;
                        if let Err(e) = conn.send_envelope(&Envelope::pong(timestamp), format).await {
                            break Err(e);
                        }
                    }
                    Ok(Envelope::Pong { .. }) => missed = 0,
                    Ok(envelope) => {
                        if incoming.send(envelope).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "Undecodable message from relay"),
                }
            }
        }
    };

    let _ = conn.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{pair, MemoryConnection};
    use parley_protocol::WireMessage;
    use serde_json::json;

    async fn send_to_client(server: &mut MemoryConnection, envelope: Envelope) {
        server
            .send_envelope(&envelope, WireFormat::Json)
            .await
            .unwrap();
    }

    async fn next_from_client(server: &mut MemoryConnection) -> Option<Envelope> {
        match server.recv().await.unwrap() {
            Some(Inbound::Message(message)) => Some(codec::decode(&message).unwrap()),
            Some(Inbound::Pong) => panic!("unexpected transport pong"),
            None => None,
        }
    }

    async fn connected(config: ClientConfig) -> (SignalingClient, MemoryConnection) {
        connected_with_heartbeat(config, 30_000).await
    }

    async fn connected_with_heartbeat(
        config: ClientConfig,
        heartbeat_ms: u64,
    ) -> (SignalingClient, MemoryConnection) {
        let (client_end, mut server) = pair(16);
        send_to_client(
            &mut server,
            Envelope::welcome(PeerId::new("alice"), PROTOCOL_VERSION, heartbeat_ms),
        )
        .await;
        let client = SignalingClient::from_connection(Box::new(client_end), config)
            .await
            .unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_handshake_and_join() {
        let (mut client, mut server) = connected(ClientConfig::default()).await;

        assert_eq!(client.peer_id().as_str(), "alice");
        assert_eq!(client.heartbeat_ms(), 30_000);

        client.join("lobby").await.unwrap();
        assert_eq!(
            next_from_client(&mut server).await,
            Some(Envelope::join("lobby"))
        );

        send_to_client(
            &mut server,
            Envelope::joined("lobby", vec![PeerId::new("bob")]),
        )
        .await;
        assert_eq!(
            client.recv().await,
            Some(Envelope::joined("lobby", vec![PeerId::new("bob")]))
        );

        client
            .send_session_description(PeerId::new("bob"), json!({"type": "offer", "sdp": "v=0"}))
            .await
            .unwrap();
        assert_eq!(
            next_from_client(&mut server).await.map(|e| e.kind()),
            Some(parley_protocol::EnvelopeKind::RelaySessionDescription)
        );

        client.close().await.unwrap();
        assert_eq!(next_from_client(&mut server).await, None);
    }

    #[tokio::test]
    async fn test_rejects_incompatible_version() {
        let (client_end, mut server) = pair(4);
        send_to_client(
            &mut server,
            Envelope::welcome(PeerId::new("alice"), Version::new(2, 0), 30_000),
        )
        .await;

        let result = SignalingClient::from_connection(Box::new(client_end), ClientConfig::default()).await;
        assert!(matches!(
            result,
            Err(TransportError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_skips_envelopes_before_welcome() {
        let (client_end, mut server) = pair(4);
        send_to_client(&mut server, Envelope::ping()).await;
        server
            .send(WireMessage::Text(
                r#"{"type":"welcome","peerId":"carol","version":"1.3","heartbeatMs":5000}"#.into(),
            ))
            .await
            .unwrap();

        let client = SignalingClient::from_connection(Box::new(client_end), ClientConfig::default())
            .await
            .unwrap();
        assert_eq!(client.peer_id().as_str(), "carol");
        assert_eq!(client.server_version(), Version::new(1, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_welcome_timeout() {
        let (client_end, _server) = pair(4);
        let result = SignalingClient::from_connection(Box::new(client_end), ClientConfig::default()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_answers_server_ping() {
        let (mut client, mut server) = connected(ClientConfig::default()).await;

        send_to_client(&mut server, Envelope::Ping { timestamp: Some(42) }).await;
        assert_eq!(
            next_from_client(&mut server).await,
            Some(Envelope::pong(Some(42)))
        );

        // Pings never reach the application.
        send_to_client(&mut server, Envelope::chat("after")).await;
        assert_eq!(client.recv().await, Some(Envelope::chat("after")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_silent_relay() {
        let config = ClientConfig {
            heartbeat_interval: Duration::from_secs(30),
            max_missed: 2,
            ..Default::default()
        };
        let (mut client, mut server) = connected(config).await;

        // Two pings go out unanswered, the third tick closes the connection.
        for _ in 0..2 {
            assert!(matches!(
                next_from_client(&mut server).await,
                Some(Envelope::Ping { .. })
            ));
        }
        assert_eq!(next_from_client(&mut server).await, None);
        assert_eq!(client.recv().await, None);
        assert!(matches!(client.close().await, Err(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection() {
        let (mut client, mut server) = connected(ClientConfig::default()).await;

        for _ in 0..4 {
            let ping = next_from_client(&mut server).await;
            let Some(Envelope::Ping { timestamp }) = ping else {
                panic!("expected ping, got {ping:?}");
            };
            send_to_client(&mut server, Envelope::pong(timestamp)).await;
        }

        send_to_client(&mut server, Envelope::chat("still here")).await;
        assert_eq!(client.recv().await, Some(Envelope::chat("still here")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_on_relay_interval() {
        let (_client, mut server) = connected_with_heartbeat(ClientConfig::default(), 5_000).await;

        let start = tokio::time::Instant::now();
        assert!(matches!(
            next_from_client(&mut server).await,
            Some(Envelope::Ping { .. })
        ));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "pinged after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "pinged after {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_panic() {
        let config = ClientConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        let (client, mut server) = connected_with_heartbeat(config, 0).await;

        while next_from_client(&mut server).await.is_some() {}
        assert!(matches!(client.close().await, Err(TransportError::Timeout)));
    }

    #[test]
    fn test_ping_interval() {
        let fallback = Duration::from_secs(30);
        assert_eq!(ping_interval(5_000, fallback), Duration::from_secs(5));
        assert_eq!(ping_interval(0, fallback), fallback);
        assert_eq!(ping_interval(0, Duration::ZERO), Duration::from_millis(1));
    }
}
