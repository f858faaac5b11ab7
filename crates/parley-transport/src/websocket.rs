//! WebSocket connections over tokio-tungstenite.
//!
//! Used by [`SignalingClient`](crate::SignalingClient) to reach a relay, and
//! by anything that accepts raw TCP streams outside of axum.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parley_protocol::WireMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error};

use crate::traits::{Connection, Inbound, TransportError};

/// A WebSocket connection.
pub struct WebSocketConnection<S> {
    stream: WebSocketStream<S>,
    remote_addr: Option<String>,
    is_open: bool,
}

impl WebSocketConnection<MaybeTlsStream<TcpStream>> {
    /// Open a client connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connect or the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(|e| {
            error!("WebSocket handshake with {} failed: {}", url, e);
            TransportError::Handshake(e.to_string())
        })?;

        debug!("Connected to {}", url);
        Ok(Self::new(stream, Some(url.to_string())))
    }
}

impl WebSocketConnection<TcpStream> {
    /// Run the server side of the handshake on an accepted TCP stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn accept(stream: TcpStream) -> Result<Self, TransportError> {
        let addr = stream.peer_addr().map_err(TransportError::Io)?;

        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        debug!("WebSocket handshake completed with {}", addr);
        Ok(Self::new(ws_stream, Some(addr.to_string())))
    }
}

impl<S> WebSocketConnection<S> {
    /// Wrap an established WebSocket stream.
    pub fn new(stream: WebSocketStream<S>, remote_addr: Option<String>) -> Self {
        Self {
            stream,
            remote_addr,
            is_open: true,
        }
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Inbound::Message(WireMessage::Text(text))));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Inbound::Message(WireMessage::Binary(Bytes::from(
                        data,
                    )))));
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite queues the pong and flushes it on the next write.
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
