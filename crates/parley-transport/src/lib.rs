//! # parley-transport
//!
//! Connection abstraction for the Parley signaling relay.
//!
//! The relay speaks to every client through the [`Connection`] trait, so the
//! same driver serves:
//!
//! - **axum** - WebSocket upgrades inside the HTTP server
//! - **websocket** - Plain tokio-tungstenite streams, client or server side
//! - **memory** - In-process pairs for tests
//!
//! [`SignalingClient`] sits on top of any connection and handles the
//! welcome handshake and keep-alive for client applications.
//!
//! ```rust,ignore
//! use parley_transport::{ClientConfig, SignalingClient};
//!
//! let mut client = SignalingClient::connect("ws://127.0.0.1:8080/ws", ClientConfig::default()).await?;
//! client.join("lobby").await?;
//! while let Some(envelope) = client.recv().await {
//!     // Handle newPeer, relaySessionDescription, iceCandidate...
//! }
//! ```

pub mod client;
pub mod memory;
pub mod traits;

#[cfg(feature = "axum")]
pub mod axum_ws;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{ClientConfig, SignalingClient};
pub use memory::MemoryConnection;
pub use traits::{Connection, Inbound, TransportError};

#[cfg(feature = "axum")]
pub use axum_ws::AxumConnection;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
