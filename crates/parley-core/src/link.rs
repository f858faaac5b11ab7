//! Outbound links to connected peers.
//!
//! A [`PeerLink`] is the write side of a connection as seen by the rest of
//! the relay: a bounded FIFO queue of envelopes plus liveness bookkeeping.
//! The connection's driver owns the matching [`Outbox`].

use parley_protocol::Envelope;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors when queueing an envelope for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The peer's outbound queue is full; the envelope was rejected.
    #[error("Outbound queue full")]
    QueueFull,

    /// The peer's connection has gone away.
    #[error("Connection closed")]
    Closed,
}

struct LinkShared {
    sender: mpsc::Sender<Arc<Envelope>>,
    missed_pongs: AtomicU32,
    last_seen: AtomicU64,
    evicted: AtomicBool,
    evict_signal: Notify,
}

/// Handle used to queue envelopes for one peer. Cheap to clone.
#[derive(Clone)]
pub struct PeerLink {
    shared: Arc<LinkShared>,
}

/// Receiving half of a peer link, owned by the connection driver.
pub struct Outbox {
    receiver: mpsc::Receiver<Arc<Envelope>>,
    shared: Arc<LinkShared>,
}

impl PeerLink {
    /// Create a link with an outbound queue of the given capacity.
    #[must_use]
    pub fn channel(capacity: usize) -> (PeerLink, Outbox) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(LinkShared {
            sender,
            missed_pongs: AtomicU32::new(0),
            last_seen: AtomicU64::new(now_millis()),
            evicted: AtomicBool::new(false),
            evict_signal: Notify::new(),
        });
        let outbox = Outbox {
            receiver,
            shared: Arc::clone(&shared),
        };
        (PeerLink { shared }, outbox)
    }

    /// Queue an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] when the peer is not draining its
    /// queue, or [`SendError::Closed`] when the connection is gone.
    pub fn send(&self, envelope: impl Into<Arc<Envelope>>) -> Result<(), SendError> {
        self.shared
            .sender
            .try_send(envelope.into())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Check if the receiving side is still alive.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.shared.sender.is_closed()
    }

    /// Record a sign of life from the peer.
    pub fn record_pong(&self) {
        self.shared.missed_pongs.store(0, Ordering::Relaxed);
        self.shared.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    /// Record that a ping went out; returns the number of unanswered pings.
    pub fn record_ping_sent(&self) -> u32 {
        self.shared.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of pings sent since the last pong.
    #[must_use]
    pub fn missed_pongs(&self) -> u32 {
        self.shared.missed_pongs.load(Ordering::Relaxed)
    }

    /// Last time the peer showed signs of life, in Unix milliseconds.
    #[must_use]
    pub fn last_seen(&self) -> u64 {
        self.shared.last_seen.load(Ordering::Relaxed)
    }

    /// Ask the connection driver to close this connection.
    ///
    /// Returns `true` the first time it is called.
    pub fn evict(&self) -> bool {
        if self.shared.evicted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.evict_signal.notify_one();
        true
    }

    /// Check if the link has been evicted.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.shared.evicted.load(Ordering::SeqCst)
    }
}

impl Outbox {
    /// Wait for the next queued envelope.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.recv().await
    }

    /// Take a queued envelope if one is ready.
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.receiver.try_recv().ok()
    }

    /// Handle to wait for eviction independently of the queue.
    #[must_use]
    pub fn eviction(&self) -> Eviction {
        Eviction {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Check if the link has been evicted.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.shared.evicted.load(Ordering::SeqCst)
    }
}

/// Eviction signal of one link.
pub struct Eviction {
    shared: Arc<LinkShared>,
}

impl Eviction {
    /// Resolve once the link has been evicted.
    pub async fn wait(&self) {
        // notify_one stores a permit, so an eviction before this call is not lost.
        self.shared.evict_signal.notified().await;
    }
}
