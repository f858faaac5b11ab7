//! Transport abstraction traits for Parley.
//!
//! The relay never touches a socket directly. Every transport hands it a
//! [`Connection`] that yields whole text or binary messages.

use async_trait::async_trait;
use parley_protocol::{codec, Envelope, ProtocolError, Version, WireFormat, WireMessage};
use thiserror::Error;

/// Something read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete text or binary message.
    Message(WireMessage),
    /// A transport-level pong.
    Pong,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The opening handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server speaks an incompatible protocol version.
    #[error("Incompatible protocol version: server {server}, client {client}")]
    VersionMismatch { server: Version, client: Version },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An active connection to one remote endpoint.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next message.
    ///
    /// Returns `None` once the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Send a message.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Encode and send an envelope.
    async fn send_envelope(
        &mut self,
        envelope: &Envelope,
        format: WireFormat,
    ) -> Result<(), TransportError> {
        let message = codec::encode(envelope, format)?;
        self.send(message).await
    }

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
