//! Envelope types for the Parley protocol.
//!
//! Every message on the wire is an envelope: a JSON object whose `type`
//! field selects the variant. Payloads carried by relay envelopes (`desc`,
//! `candidate`) are opaque to the relay and forwarded untouched.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::version::Version;

/// A room identifier, supplied by clients.
pub type RoomId = String;

/// Numeric error codes carried by `error` envelopes.
pub mod codes {
    /// The message could not be parsed as an envelope.
    pub const MALFORMED: u16 = 1001;
    /// The `type` tag names no known envelope kind.
    pub const UNKNOWN_KIND: u16 = 1002;
    /// The connection must join a room first.
    pub const NOT_JOINED: u16 = 1003;
    /// A relay envelope is missing its `peerId` target.
    pub const MISSING_TARGET: u16 = 1004;
    /// The relay target is not connected or not in the sender's room.
    pub const PEER_UNAVAILABLE: u16 = 1005;
    /// The room id failed validation.
    pub const INVALID_ROOM: u16 = 1006;
    /// The room could not be joined because a limit was reached.
    pub const ROOM_LIMIT: u16 = 1007;
    /// Clients may not send this kind.
    pub const UNEXPECTED_KIND: u16 = 1008;
}

/// A peer identifier issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, collision-resistant identifier (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Envelope kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Join,
    Joined,
    Welcome,
    NewPeer,
    RelaySessionDescription,
    IceCandidate,
    Message,
    PeerDisconnected,
    Ping,
    Pong,
    Error,
}

impl EnvelopeKind {
    /// All kinds, in wire-tag order.
    pub const ALL: [EnvelopeKind; 11] = [
        EnvelopeKind::Join,
        EnvelopeKind::Joined,
        EnvelopeKind::Welcome,
        EnvelopeKind::NewPeer,
        EnvelopeKind::RelaySessionDescription,
        EnvelopeKind::IceCandidate,
        EnvelopeKind::Message,
        EnvelopeKind::PeerDisconnected,
        EnvelopeKind::Ping,
        EnvelopeKind::Pong,
        EnvelopeKind::Error,
    ];

    /// The `type` tag used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Joined => "joined",
            EnvelopeKind::Welcome => "welcome",
            EnvelopeKind::NewPeer => "newPeer",
            EnvelopeKind::RelaySessionDescription => "relaySessionDescription",
            EnvelopeKind::IceCandidate => "iceCandidate",
            EnvelopeKind::Message => "message",
            EnvelopeKind::PeerDisconnected => "peerDisconnected",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::Error => "error",
        }
    }

    /// Resolve a wire tag, accepting the legacy `joinRoom` spelling.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag == "joinRoom" {
            return Some(EnvelopeKind::Join);
        }
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Kinds that only the server may emit.
    #[must_use]
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            EnvelopeKind::Joined
                | EnvelopeKind::Welcome
                | EnvelopeKind::NewPeer
                | EnvelopeKind::PeerDisconnected
                | EnvelopeKind::Error
        )
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Request to join a room.
    #[serde(rename = "join", alias = "joinRoom")]
    Join {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    /// Join acknowledgment, listing the members already in the room.
    #[serde(rename = "joined")]
    Joined {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        peers: Vec<PeerId>,
    },

    /// First envelope on every connection.
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        version: Version,
        /// Interval at which the server pings, in milliseconds.
        #[serde(rename = "heartbeatMs")]
        heartbeat_ms: u64,
    },

    /// A peer joined the room.
    #[serde(rename = "newPeer")]
    NewPeer {
        #[serde(rename = "fromID")]
        from_id: PeerId,
    },

    /// SDP offer/answer for one peer.
    ///
    /// On the way in `peer_id` is the target; on the way out it names the sender.
    #[serde(rename = "relaySessionDescription")]
    RelaySessionDescription {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        desc: serde_json::Value,
    },

    /// ICE candidate for one peer. Same addressing as session descriptions.
    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        candidate: serde_json::Value,
    },

    /// Chat message; broadcast to the room unless `peer_id` is set.
    #[serde(rename = "message")]
    Message {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        message: String,
    },

    /// A room member went away.
    #[serde(rename = "peerDisconnected")]
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong, echoing the ping timestamp.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Error reply.
    #[serde(rename = "error")]
    Error { code: u16, text: String },
}

impl Envelope {
    /// Get the envelope kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Join { .. } => EnvelopeKind::Join,
            Envelope::Joined { .. } => EnvelopeKind::Joined,
            Envelope::Welcome { .. } => EnvelopeKind::Welcome,
            Envelope::NewPeer { .. } => EnvelopeKind::NewPeer,
            Envelope::RelaySessionDescription { .. } => EnvelopeKind::RelaySessionDescription,
            Envelope::IceCandidate { .. } => EnvelopeKind::IceCandidate,
            Envelope::Message { .. } => EnvelopeKind::Message,
            Envelope::PeerDisconnected { .. } => EnvelopeKind::PeerDisconnected,
            Envelope::Ping { .. } => EnvelopeKind::Ping,
            Envelope::Pong { .. } => EnvelopeKind::Pong,
            Envelope::Error { .. } => EnvelopeKind::Error,
        }
    }

    /// The addressed peer of a relay or direct chat envelope.
    #[must_use]
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Envelope::RelaySessionDescription { peer_id, .. }
            | Envelope::IceCandidate { peer_id, .. }
            | Envelope::Message { peer_id, .. } => peer_id.as_ref(),
            _ => None,
        }
    }

    /// Rewrite the `peerId` of a relay envelope, leaving its payload intact.
    ///
    /// Envelopes without a `peerId` slot are returned unchanged.
    #[must_use]
    pub fn with_peer(mut self, id: PeerId) -> Self {
        match &mut self {
            Envelope::RelaySessionDescription { peer_id, .. }
            | Envelope::IceCandidate { peer_id, .. } => *peer_id = Some(id),
            _ => {}
        }
        self
    }

    /// Create a join request.
    #[must_use]
    pub fn join(room_id: impl Into<RoomId>) -> Self {
        Envelope::Join {
            room_id: room_id.into(),
        }
    }

    /// Create a join acknowledgment.
    #[must_use]
    pub fn joined(room_id: impl Into<RoomId>, peers: Vec<PeerId>) -> Self {
        Envelope::Joined {
            room_id: room_id.into(),
            peers,
        }
    }

    /// Create a welcome envelope.
    #[must_use]
    pub fn welcome(peer_id: PeerId, version: Version, heartbeat_ms: u64) -> Self {
        Envelope::Welcome {
            peer_id,
            version,
            heartbeat_ms,
        }
    }

    /// Create a new-peer notification.
    #[must_use]
    pub fn new_peer(from_id: PeerId) -> Self {
        Envelope::NewPeer { from_id }
    }

    /// Create a session description relay addressed to `peer_id`.
    #[must_use]
    pub fn session_description(peer_id: PeerId, desc: serde_json::Value) -> Self {
        Envelope::RelaySessionDescription {
            peer_id: Some(peer_id),
            desc,
        }
    }

    /// Create an ICE candidate relay addressed to `peer_id`.
    #[must_use]
    pub fn ice_candidate(peer_id: PeerId, candidate: serde_json::Value) -> Self {
        Envelope::IceCandidate {
            peer_id: Some(peer_id),
            candidate,
        }
    }

    /// Create a chat message for the whole room.
    #[must_use]
    pub fn chat(message: impl Into<String>) -> Self {
        Envelope::Message {
            peer_id: None,
            from: None,
            message: message.into(),
        }
    }

    /// Create a departure notification.
    #[must_use]
    pub fn peer_disconnected(peer_id: PeerId) -> Self {
        Envelope::PeerDisconnected { peer_id }
    }

    /// Create a ping.
    #[must_use]
    pub fn ping() -> Self {
        Envelope::Ping { timestamp: None }
    }

    /// Create a pong.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Envelope::Pong { timestamp }
    }

    /// Create an error reply.
    #[must_use]
    pub fn error(code: u16, text: impl Into<String>) -> Self {
        Envelope::Error {
            code,
            text: text.into(),
        }
    }
}
