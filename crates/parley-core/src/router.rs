//! Signaling message router for Parley.
//!
//! The router interprets inbound envelopes for one connection at a time and
//! relays them to other members of the sender's room.

use crate::directory::{Departure, DirectoryConfig, DirectoryError, RoomDirectory};
use crate::link::{Outbox, PeerLink, SendError, DEFAULT_OUTBOUND_CAPACITY};
use crate::registry::ConnectionRegistry;
use parley_protocol::{
    codec, codes, Envelope, EnvelopeKind, PeerId, ProtocolError, RoomId, WireMessage,
    PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Per-message routing failures.
///
/// Every one of these is reported to the sender as an `error` envelope; none
/// of them closes the connection.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The message could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The message exceeds the configured size limit.
    #[error("Message size {size} exceeds limit {max}")]
    TooLarge { size: usize, max: usize },

    /// Only `join` is accepted before joining a room.
    #[error("Must join a room before sending {0}")]
    NotJoined(EnvelopeKind),

    /// A relay envelope has no target.
    #[error("{0} requires a peerId")]
    MissingTarget(EnvelopeKind),

    /// The relay target is not reachable from the sender's room.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(PeerId),

    /// The relay target's outbound queue is full.
    #[error("Peer {0} is not keeping up, message dropped")]
    Backpressure(PeerId),

    /// Joining failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Clients may not send this kind.
    #[error("Unexpected message type: {0}")]
    UnexpectedKind(EnvelopeKind),

    /// The session already disconnected.
    #[error("Session closed")]
    Closed,
}

impl RouteError {
    /// Wire error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RouteError::Protocol(e) => e.code(),
            RouteError::TooLarge { .. } => codes::MALFORMED,
            RouteError::NotJoined(_) | RouteError::Closed => codes::NOT_JOINED,
            RouteError::MissingTarget(_) => codes::MISSING_TARGET,
            RouteError::PeerUnavailable(_) | RouteError::Backpressure(_) => {
                codes::PEER_UNAVAILABLE
            }
            RouteError::Directory(e) => e.code(),
            RouteError::UnexpectedKind(_) => codes::UNEXPECTED_KIND,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RouteError::Protocol(ProtocolError::UnknownType(_)) => "unknown_kind",
            RouteError::Protocol(_) | RouteError::TooLarge { .. } => "malformed",
            RouteError::NotJoined(_) => "not_joined",
            RouteError::MissingTarget(_) => "missing_target",
            RouteError::PeerUnavailable(_) => "peer_unavailable",
            RouteError::Backpressure(_) => "backpressure",
            RouteError::Directory(_) => "join_rejected",
            RouteError::UnexpectedKind(_) => "unexpected_kind",
            RouteError::Closed => "closed",
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Room limits.
    pub directory: DirectoryConfig,
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Heartbeat interval announced to clients.
    pub heartbeat_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_message_size: 64 * 1024,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Connection state as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected but not in a room; only `join` is accepted.
    Connected,
    /// Member of a room.
    Joined(RoomId),
    /// Cleaned up. Terminal.
    Disconnected,
}

/// Per-connection routing state, owned by the connection's driver.
pub struct Session {
    peer_id: PeerId,
    link: PeerLink,
    state: SessionState,
}

impl Session {
    /// The server-issued id of this connection.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The joined room, if any.
    #[must_use]
    pub fn room(&self) -> Option<&RoomId> {
        match &self.state {
            SessionState::Joined(room) => Some(room),
            _ => None,
        }
    }

    /// Check whether cleanup already ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    /// Record a transport-level sign of life.
    pub fn touch(&self) {
        self.link.record_pong();
    }
}

/// Why an envelope could not be handed to a peer.
enum DeliveryFailure {
    /// Peer not registered; its directory entry was stale.
    Unregistered,
    /// Peer's connection closed between lookup and send.
    Closed,
    /// Peer's outbound queue is full.
    QueueFull,
}

/// The signaling router.
///
/// Owns the connection registry and the room directory; both are shared
/// with other components through `Arc`.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<RoomDirectory>,
    config: RouterConfig,
}

impl MessageRouter {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            directory: Arc::new(RoomDirectory::with_config(config.directory.clone())),
            config,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The room directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let directory = self.directory.stats();
        RouterStats {
            peer_count: self.registry.len(),
            room_count: directory.room_count,
            member_count: directory.member_count,
        }
    }

    /// Register a new connection.
    ///
    /// The returned outbox already holds the `welcome` envelope.
    pub fn connect(&self) -> (Session, Outbox) {
        let (link, outbox) = PeerLink::channel(self.config.outbound_capacity);
        let peer_id = self.registry.register(link.clone());

        let welcome = Envelope::welcome(
            peer_id.clone(),
            PROTOCOL_VERSION,
            self.config.heartbeat_interval.as_millis() as u64,
        );
        if let Err(e) = link.send(welcome) {
            warn!(peer = %peer_id, error = %e, "Failed to queue welcome");
        }

        debug!(peer = %peer_id, "Session opened");
        let session = Session {
            peer_id,
            link,
            state: SessionState::Connected,
        };
        (session, outbox)
    }

    /// Decode and handle one inbound transport message.
    ///
    /// Failures are answered with an `error` envelope and returned for
    /// accounting; the session stays usable.
    pub fn handle_message(
        &self,
        session: &mut Session,
        message: &WireMessage,
    ) -> Result<EnvelopeKind, RouteError> {
        let result = if message.len() > self.config.max_message_size {
            Err(RouteError::TooLarge {
                size: message.len(),
                max: self.config.max_message_size,
            })
        } else {
            codec::decode(message)
                .map_err(RouteError::from)
                .and_then(|envelope| self.dispatch(session, envelope))
        };

        if let Err(e) = &result {
            self.reject(session, e);
        }
        result
    }

    /// Handle one decoded envelope.
    ///
    /// Same failure handling as [`MessageRouter::handle_message`].
    pub fn handle_envelope(
        &self,
        session: &mut Session,
        envelope: Envelope,
    ) -> Result<EnvelopeKind, RouteError> {
        let result = self.dispatch(session, envelope);
        if let Err(e) = &result {
            self.reject(session, e);
        }
        result
    }

    /// Tear down a session: leave its room, unregister it, and tell the
    /// remaining members.
    ///
    /// Runs at most once per session; later calls return `false`.
    pub fn disconnect(&self, session: &mut Session) -> bool {
        if session.is_closed() {
            return false;
        }
        session.state = SessionState::Disconnected;

        // Leave before unregistering so relays never find a member without a link.
        if let Some(departure) = self.directory.leave(&session.peer_id) {
            self.announce_departure(&session.peer_id, &departure);
        }
        self.registry.unregister(&session.peer_id);

        debug!(peer = %session.peer_id, "Session closed");
        true
    }

    fn dispatch(&self, session: &mut Session, envelope: Envelope) -> Result<EnvelopeKind, RouteError> {
        if session.is_closed() {
            return Err(RouteError::Closed);
        }

        let kind = envelope.kind();
        trace!(peer = %session.peer_id, kind = %kind, "Inbound envelope");

        if kind.is_server_only() {
            return Err(RouteError::UnexpectedKind(kind));
        }

        match envelope {
            Envelope::Ping { timestamp } => {
                session.link.record_pong();
                self.send_to_self(session, Envelope::pong(timestamp));
            }
            Envelope::Pong { .. } => session.link.record_pong(),
            Envelope::Join { room_id } => self.join(session, room_id)?,
            envelope => {
                let room = session.room().cloned().ok_or(RouteError::NotJoined(kind))?;
                match envelope {
                    Envelope::Message {
                        peer_id: None,
                        message,
                        ..
                    } => self.broadcast_chat(session, &room, message),
                    envelope => self.relay(session, &room, envelope)?,
                }
            }
        }

        Ok(kind)
    }

    fn join(&self, session: &mut Session, room_id: RoomId) -> Result<(), RouteError> {
        // The ack is queued under the directory lock so that any departure
        // from the new room reaches the joiner after its roster.
        let outcome = self.directory.join_then(&room_id, &session.peer_id, |outcome| {
            self.send_to_self(
                session,
                Envelope::joined(room_id.clone(), outcome.prior_members.clone()),
            );
        })?;

        if let Some(departure) = &outcome.departure {
            self.announce_departure(&session.peer_id, departure);
        }
        session.state = SessionState::Joined(room_id.clone());

        let notice = Arc::new(Envelope::new_peer(session.peer_id.clone()));
        for member in &outcome.prior_members {
            let _ = self.deliver(member, Arc::clone(&notice));
        }

        info!(
            room = %room_id,
            peer = %session.peer_id,
            notified = outcome.prior_members.len(),
            "Peer joined room"
        );
        Ok(())
    }

    /// Forward a targeted envelope to one member of the sender's room.
    fn relay(&self, session: &Session, room: &str, envelope: Envelope) -> Result<(), RouteError> {
        let kind = envelope.kind();
        let target = envelope
            .target()
            .cloned()
            .ok_or(RouteError::MissingTarget(kind))?;

        if !self.directory.is_member(room, &target) {
            debug!(peer = %session.peer_id, target = %target, kind = %kind, "Relay target not in room");
            return Err(RouteError::PeerUnavailable(target));
        }

        let forwarded = match envelope {
            Envelope::Message { message, .. } => Envelope::Message {
                peer_id: Some(session.peer_id.clone()),
                from: Some(session.peer_id.to_string()),
                message,
            },
            other => other.with_peer(session.peer_id.clone()),
        };

        match self.deliver(&target, Arc::new(forwarded)) {
            Ok(()) => {
                trace!(peer = %session.peer_id, target = %target, kind = %kind, "Relayed");
                Ok(())
            }
            Err(DeliveryFailure::QueueFull) => Err(RouteError::Backpressure(target)),
            Err(DeliveryFailure::Unregistered | DeliveryFailure::Closed) => {
                Err(RouteError::PeerUnavailable(target))
            }
        }
    }

    fn broadcast_chat(&self, session: &Session, room: &str, message: String) {
        let envelope = Arc::new(Envelope::Message {
            peer_id: None,
            from: Some(session.peer_id.to_string()),
            message,
        });

        let mut recipients = 0;
        for member in self.directory.members_of(room) {
            if member == session.peer_id {
                continue;
            }
            if self.deliver(&member, Arc::clone(&envelope)).is_ok() {
                recipients += 1;
            }
        }
        trace!(room = %room, peer = %session.peer_id, recipients, "Broadcast chat");
    }

    fn announce_departure(&self, peer_id: &PeerId, departure: &Departure) {
        let notice = Arc::new(Envelope::peer_disconnected(peer_id.clone()));
        for member in &departure.remaining {
            let _ = self.deliver(member, Arc::clone(&notice));
        }
        debug!(
            room = %departure.room_id,
            peer = %peer_id,
            notified = departure.remaining.len(),
            room_closed = departure.room_closed,
            "Announced departure"
        );
    }

    /// Queue an envelope for a room member.
    ///
    /// A member with no registered connection is a stale directory entry; it
    /// is removed and its departure announced.
    fn deliver(&self, target: &PeerId, envelope: Arc<Envelope>) -> Result<(), DeliveryFailure> {
        let Some(link) = self.registry.lookup(target) else {
            warn!(peer = %target, "Dropping stale room member");
            if let Some(departure) = self.directory.leave(target) {
                self.announce_departure(target, &departure);
            }
            return Err(DeliveryFailure::Unregistered);
        };

        link.send(envelope).map_err(|e| match e {
            SendError::QueueFull => {
                warn!(peer = %target, "Outbound queue full, rejecting envelope");
                DeliveryFailure::QueueFull
            }
            SendError::Closed => {
                debug!(peer = %target, "Connection closed during send");
                DeliveryFailure::Closed
            }
        })
    }

    fn send_to_self(&self, session: &Session, envelope: Envelope) {
        if let Err(e) = session.link.send(envelope) {
            warn!(peer = %session.peer_id, error = %e, "Failed to queue reply");
        }
    }

    fn reject(&self, session: &Session, error: &RouteError) {
        if matches!(error, RouteError::Closed) {
            return;
        }
        debug!(peer = %session.peer_id, error = %error, "Rejected message");
        self.send_to_self(session, Envelope::error(error.code(), error.to_string()));
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Number of registered connections.
    pub peer_count: usize,
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of connections in a room.
    pub member_count: usize,
}
