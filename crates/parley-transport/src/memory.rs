//! In-process connections.
//!
//! [`pair`] returns two connected ends backed by bounded channels. The relay
//! tests use them to drive a full session without opening sockets.

use async_trait::async_trait;
use parley_protocol::WireMessage;
use tokio::sync::mpsc;

use crate::traits::{Connection, Inbound, TransportError};

/// One end of an in-memory connection.
pub struct MemoryConnection {
    sender: Option<mpsc::Sender<WireMessage>>,
    receiver: mpsc::Receiver<WireMessage>,
    label: &'static str,
}

/// Create two connected ends, each buffering up to `capacity` messages.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));

    let a = MemoryConnection {
        sender: Some(a_tx),
        receiver: a_rx,
        label: "memory:a",
    };
    let b = MemoryConnection {
        sender: Some(b_tx),
        receiver: b_rx,
        label: "memory:b",
    };
    (a, b)
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        Ok(self.receiver.recv().await.map(Inbound::Message))
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the other side's stream.
        self.sender = None;
        self.receiver.close();
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.label.to_string())
    }

    fn is_open(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }
}
