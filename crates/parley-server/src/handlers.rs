//! Connection handlers for the Parley server.
//!
//! This module owns the HTTP surface and the per-connection driver.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, Direction};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::{LivenessMonitor, MessageRouter, RouteError};
use parley_protocol::{codec::MAX_MESSAGE_SIZE, WireFormat};
use parley_transport::{AxumConnection, Connection, Inbound};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How long a closing connection may take to flush its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: Arc<MessageRouter>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            router: Arc::new(MessageRouter::with_config(config.router_config())),
            config,
        }
    }

    /// Check if the connection limit is reached.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.router.registry().len() >= self.config.limits.max_connections
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let liveness = LivenessMonitor::new(
        Arc::clone(state.router.registry()),
        config.liveness_config(),
    )
    .spawn();

    let app = app(state);
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;

    liveness.abort();
    result?;
    Ok(())
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.router.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "peers": stats.peer_count,
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.at_capacity() {
        warn!(remote = %addr, "Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    // Messages over the router limit still get an error reply; only frames
    // past the hard cap close the socket.
    let frame_cap = state.config.limits.max_message_size.max(MAX_MESSAGE_SIZE);

    ws.max_message_size(frame_cap)
        .on_upgrade(move |socket| {
            drive_connection(Box::new(AxumConnection::new(socket, Some(addr))), state)
        })
        .into_response()
}

/// Drive one connection until it closes or is evicted.
///
/// Runs the router's disconnect path exactly once on the way out.
pub async fn drive_connection(mut conn: Box<dyn Connection>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let router = &state.router;

    let (mut session, mut outbox) = router.connect();
    let eviction = outbox.eviction();
    let peer_id = session.peer_id().clone();
    let mut format = WireFormat::default();

    debug!(peer = %peer_id, remote = ?conn.remote_addr(), "Connection opened");

    let evicted = loop {
        tokio::select! {
            biased;

            _ = eviction.wait() => break true,

            envelope = outbox.recv() => {
                let Some(envelope) = envelope else { break false };
                metrics::record_envelope(envelope.kind(), Direction::Outbound);

                // A peer that stops reading stalls the send; eviction still
                // has to be able to end the session.
                let sent = tokio::select! {
                    biased;
                    _ = eviction.wait() => break true,
                    sent = conn.send_envelope(&envelope, format) => sent,
                };
                if let Err(e) = sent {
                    debug!(peer = %peer_id, error = %e, "Send failed");
                    break false;
                }
            }

            inbound = conn.recv() => {
                match inbound {
                    Ok(Some(Inbound::Message(message))) => {
                        let start = Instant::now();
                        format = message.format();

                        match router.handle_message(&mut session, &message) {
                            Ok(kind) => metrics::record_envelope(kind, Direction::Inbound),
                            Err(e) => {
                                debug!(peer = %peer_id, code = e.code(), error = %e, "Rejected message");
                                if matches!(e, RouteError::PeerUnavailable(_) | RouteError::Backpressure(_)) {
                                    metrics::record_relay_failure(e.label());
                                }
                                metrics::record_error(e.label());
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                        metrics::set_active_rooms(router.stats().room_count);
                    }
                    Ok(Some(Inbound::Pong)) => session.touch(),
                    Ok(None) => {
                        debug!(peer = %peer_id, "Connection closed by client");
                        break false;
                    }
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "Transport error");
                        metrics::record_error("transport");
                        break false;
                    }
                }
            }
        }
    };

    if evicted {
        info!(peer = %peer_id, "Closing unresponsive connection");
        metrics::record_eviction();
    }

    router.disconnect(&mut session);
    metrics::set_active_rooms(router.stats().room_count);

    // The close frame can stall behind the same unread data.
    match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer_id, error = %e, "Close failed"),
        Err(_) => debug!(peer = %peer_id, "Close timed out"),
    }
    debug!(peer = %peer_id, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::LivenessConfig;
    use parley_protocol::{codec, codes, Envelope, PeerId, WireMessage};
    use parley_transport::memory::{pair, MemoryConnection};
    use parley_transport::{ClientConfig, SignalingClient};
    use serde_json::json;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()))
    }

    fn open(state: &Arc<AppState>) -> MemoryConnection {
        let (client_end, server_end) = pair(64);
        tokio::spawn(drive_connection(Box::new(server_end), Arc::clone(state)));
        client_end
    }

    async fn client(state: &Arc<AppState>) -> SignalingClient {
        SignalingClient::from_connection(Box::new(open(state)), ClientConfig::default())
            .await
            .unwrap()
    }

    async fn next(conn: &mut MemoryConnection) -> Option<Envelope> {
        match conn.recv().await.unwrap() {
            Some(Inbound::Message(message)) => Some(codec::decode(&message).unwrap()),
            Some(Inbound::Pong) => panic!("unexpected transport pong"),
            None => None,
        }
    }

    #[tokio::test]
    async fn test_join_and_relay() {
        let state = test_state();
        let mut a = client(&state).await;
        let mut b = client(&state).await;

        a.join("room1").await.unwrap();
        assert_eq!(a.recv().await, Some(Envelope::joined("room1", vec![])));

        b.join("room1").await.unwrap();
        assert_eq!(
            b.recv().await,
            Some(Envelope::joined("room1", vec![a.peer_id().clone()]))
        );
        assert_eq!(a.recv().await, Some(Envelope::new_peer(b.peer_id().clone())));

        let offer = json!({"type": "offer", "sdp": "v=0\r\n"});
        a.send_session_description(b.peer_id().clone(), offer.clone())
            .await
            .unwrap();
        assert_eq!(
            b.recv().await,
            Some(Envelope::RelaySessionDescription {
                peer_id: Some(a.peer_id().clone()),
                desc: offer,
            })
        );

        let candidate = json!({"candidate": "candidate:1 1 UDP 2122252543 10.0.0.1 54321 typ host"});
        b.send_ice_candidate(a.peer_id().clone(), candidate.clone())
            .await
            .unwrap();
        assert_eq!(
            a.recv().await,
            Some(Envelope::IceCandidate {
                peer_id: Some(b.peer_id().clone()),
                candidate,
            })
        );
    }

    #[tokio::test]
    async fn test_relay_to_unknown_peer() {
        let state = test_state();
        let mut a = client(&state).await;

        a.join("room1").await.unwrap();
        a.recv().await.unwrap();

        a.send_session_description(PeerId::new("10086"), json!({"type": "offer"}))
            .await
            .unwrap();
        match a.recv().await {
            Some(Envelope::Error { code, .. }) => assert_eq!(code, codes::PEER_UNAVAILABLE),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_departure_is_broadcast() {
        let state = test_state();
        let mut a = client(&state).await;
        let mut b = client(&state).await;

        a.join("room1").await.unwrap();
        a.recv().await.unwrap();
        b.join("room1").await.unwrap();
        b.recv().await.unwrap();
        a.recv().await.unwrap();

        let b_id = b.peer_id().clone();
        b.close().await.unwrap();

        assert_eq!(a.recv().await, Some(Envelope::peer_disconnected(b_id)));
        assert_eq!(state.router.stats().peer_count, 1);
        assert!(state.router.directory().room_exists("room1"));
    }

    #[tokio::test]
    async fn test_chat_broadcast() {
        let state = test_state();
        let mut a = client(&state).await;
        let mut b = client(&state).await;

        a.join("room1").await.unwrap();
        a.recv().await.unwrap();
        b.join("room1").await.unwrap();
        b.recv().await.unwrap();
        a.recv().await.unwrap();

        b.send_chat("hello").await.unwrap();
        assert_eq!(
            a.recv().await,
            Some(Envelope::Message {
                peer_id: None,
                from: Some(b.peer_id().to_string()),
                message: "hello".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let state = test_state();
        let mut conn = open(&state);
        assert!(matches!(next(&mut conn).await, Some(Envelope::Welcome { .. })));

        conn.send(WireMessage::Text("not json".into())).await.unwrap();
        match next(&mut conn).await {
            Some(Envelope::Error { code, .. }) => assert_eq!(code, codes::MALFORMED),
            other => panic!("expected error, got {other:?}"),
        }

        conn.send(WireMessage::Text(r#"{"type":"join","roomId":"lobby"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next(&mut conn).await, Some(Envelope::joined("lobby", vec![])));
    }

    #[tokio::test]
    async fn test_reply_uses_sender_format() {
        let state = test_state();
        let mut conn = open(&state);
        next(&mut conn).await.unwrap();

        let ping = codec::encode(&Envelope::Ping { timestamp: Some(7) }, WireFormat::MessagePack)
            .unwrap();
        conn.send(ping).await.unwrap();

        match conn.recv().await.unwrap() {
            Some(Inbound::Message(message)) => {
                assert_eq!(message.format(), WireFormat::MessagePack);
                assert_eq!(codec::decode(&message).unwrap(), Envelope::pong(Some(7)));
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_evicted() {
        let state = test_state();
        let monitor = LivenessMonitor::new(
            Arc::clone(state.router.registry()),
            LivenessConfig {
                interval: Duration::from_secs(30),
                max_missed: 2,
            },
        )
        .spawn();

        let mut watcher = client(&state).await;
        watcher.join("room1").await.unwrap();
        watcher.recv().await.unwrap();

        let mut silent = open(&state);
        let silent_id = match next(&mut silent).await {
            Some(Envelope::Welcome { peer_id, .. }) => peer_id,
            other => panic!("expected welcome, got {other:?}"),
        };
        silent
            .send(WireMessage::Text(r#"{"type":"join","roomId":"room1"}"#.into()))
            .await
            .unwrap();

        let mut pings = 0;
        while let Some(envelope) = next(&mut silent).await {
            if matches!(envelope, Envelope::Ping { .. }) {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);

        assert_eq!(watcher.recv().await, Some(Envelope::new_peer(silent_id.clone())));
        assert_eq!(
            watcher.recv().await,
            Some(Envelope::peer_disconnected(silent_id))
        );
        assert_eq!(state.router.stats().peer_count, 1);

        monitor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_that_stops_reading_is_evicted() {
        let state = test_state();
        let monitor = LivenessMonitor::new(
            Arc::clone(state.router.registry()),
            LivenessConfig {
                interval: Duration::from_secs(30),
                max_missed: 2,
            },
        )
        .spawn();

        // Room for a single frame: the welcome fills it and every later send
        // blocks until the client reads, which it never does.
        let (mut stalled, server_end) = pair(1);
        let driver = tokio::spawn(drive_connection(Box::new(server_end), Arc::clone(&state)));
        stalled
            .send(WireMessage::Text(r#"{"type":"join","roomId":"room1"}"#.into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(driver.is_finished());
        let stats = state.router.stats();
        assert_eq!(stats.peer_count, 0);
        assert_eq!(stats.room_count, 0);

        assert!(matches!(next(&mut stalled).await, Some(Envelope::Welcome { .. })));
        assert_eq!(next(&mut stalled).await, None);

        monitor.abort();
    }

    #[test]
    fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let state = AppState::new(config);

        assert!(!state.at_capacity());
        let (_session, _outbox) = state.router.connect();
        assert!(state.at_capacity());
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = test_state();
        let mut a = client(&state).await;
        a.join("room1").await.unwrap();
        a.recv().await.unwrap();

        let Json(body) = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["peers"], 1);
        assert_eq!(body["rooms"], 1);
    }
}
