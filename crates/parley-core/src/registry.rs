//! Connection registry.
//!
//! Maps server-issued peer ids to the outbound link of their connection.

use crate::link::PeerLink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::PeerId;
use tracing::{debug, trace};

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: DashMap<PeerId, PeerLink>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and issue its peer id.
    pub fn register(&self, link: PeerLink) -> PeerId {
        loop {
            let id = PeerId::generate();
            match self.peers.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(link);
                    debug!(peer = %id, "Registered connection");
                    return id;
                }
                Entry::Occupied(_) => {
                    trace!(peer = %id, "Peer id collision, regenerating");
                }
            }
        }
    }

    /// Remove a connection.
    ///
    /// Returns the link only for the call that actually removed it.
    pub fn unregister(&self, peer_id: &PeerId) -> Option<PeerLink> {
        let removed = self.peers.remove(peer_id).map(|(_, link)| link);
        if removed.is_some() {
            debug!(peer = %peer_id, "Unregistered connection");
        }
        removed
    }

    /// Resolve a peer id to its link.
    #[must_use]
    pub fn lookup(&self, peer_id: &PeerId) -> Option<PeerLink> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    /// Check if a peer is registered.
    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of every registered peer and its link.
    #[must_use]
    pub fn links(&self) -> Vec<(PeerId, PeerLink)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
