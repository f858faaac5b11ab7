//! Room directory for Parley.
//!
//! Rooms are named groups of peers. A room exists while it has members and
//! a peer is a member of at most one room at a time.

use parley_protocol::{codes, PeerId, RoomId};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room_id: &str) -> Result<(), &'static str> {
    if room_id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room_id.chars().any(char::is_control) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// Room has reached its member limit.
    #[error("Room is full: {0}")]
    RoomFull(RoomId),
}

impl DirectoryError {
    /// Wire error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            DirectoryError::InvalidRoom(_) => codes::INVALID_ROOM,
            DirectoryError::MaxRoomsReached | DirectoryError::RoomFull(_) => codes::ROOM_LIMIT,
        }
    }
}

/// Directory configuration.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum members per room.
    pub max_peers_per_room: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_peers_per_room: 64,
        }
    }
}

/// A peer leaving a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Room that was left.
    pub room_id: RoomId,
    /// Members still in the room.
    pub remaining: Vec<PeerId>,
    /// Whether the room was removed because it became empty.
    pub room_closed: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Members of the room before the join, never including the joiner.
    pub prior_members: Vec<PeerId>,
    /// Implicit departure from the previously joined room, if any. Set
    /// even when the peer re-joins the room it is already in.
    pub departure: Option<Departure>,
}

#[derive(Default)]
struct DirectoryState {
    rooms: HashMap<RoomId, HashSet<PeerId>>,
    membership: HashMap<PeerId, RoomId>,
}

impl DirectoryState {
    fn remove_member(&mut self, peer_id: &PeerId) -> Option<Departure> {
        let room_id = self.membership.remove(peer_id)?;
        let members = self.rooms.get_mut(&room_id)?;
        members.remove(peer_id);

        let remaining: Vec<PeerId> = members.iter().cloned().collect();
        let room_closed = remaining.is_empty();
        if room_closed {
            self.rooms.remove(&room_id);
            debug!(room = %room_id, "Removed empty room");
        }

        Some(Departure {
            room_id,
            remaining,
            room_closed,
        })
    }
}

/// Room membership directory.
///
/// Both the room map and the peer→room index sit behind one lock so a join
/// and its implicit leave are a single step.
pub struct RoomDirectory {
    state: Mutex<DirectoryState>,
    config: DirectoryConfig,
}

impl RoomDirectory {
    /// Create a directory with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DirectoryConfig::default())
    }

    /// Create a directory with custom limits.
    #[must_use]
    pub fn with_config(config: DirectoryConfig) -> Self {
        info!(?config, "Creating room directory");
        Self {
            state: Mutex::new(DirectoryState::default()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peer to a room, creating the room if needed.
    ///
    /// A peer already in a room leaves it first, including when it re-joins
    /// the same room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid or a limit is reached. The
    /// peer's existing membership is untouched in that case.
    pub fn join(&self, room_id: &str, peer_id: &PeerId) -> Result<JoinOutcome, DirectoryError> {
        self.join_then(room_id, peer_id, |_| {})
    }

    /// Like [`join`](Self::join), running `on_joined` before the directory
    /// lock is released.
    ///
    /// Anything `on_joined` queues is ordered ahead of every departure
    /// observed after this join.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join); `on_joined` is not called on error.
    pub fn join_then<F>(
        &self,
        room_id: &str,
        peer_id: &PeerId,
        on_joined: F,
    ) -> Result<JoinOutcome, DirectoryError>
    where
        F: FnOnce(&JoinOutcome),
    {
        validate_room_id(room_id).map_err(DirectoryError::InvalidRoom)?;

        let mut state = self.lock();

        let current = state.membership.get(peer_id).cloned();
        let rejoining = current.as_deref() == Some(room_id);
        // Leaving a room the peer has to itself frees a room slot.
        let frees_room = current
            .as_ref()
            .and_then(|room| state.rooms.get(room))
            .is_some_and(|members| members.len() == 1);

        match state.rooms.get(room_id) {
            Some(members) if !rejoining && members.len() >= self.config.max_peers_per_room => {
                return Err(DirectoryError::RoomFull(room_id.to_string()));
            }
            None if state.rooms.len() - usize::from(frees_room) >= self.config.max_rooms => {
                return Err(DirectoryError::MaxRoomsReached);
            }
            _ => {}
        }

        let departure = state.remove_member(peer_id);

        let members = state.rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!(room = %room_id, "Creating room");
            HashSet::new()
        });
        let prior_members: Vec<PeerId> = members.iter().cloned().collect();
        members.insert(peer_id.clone());
        let size = members.len();
        state.membership.insert(peer_id.clone(), room_id.to_string());

        debug!(room = %room_id, peer = %peer_id, members = size, "Joined room");

        let outcome = JoinOutcome {
            prior_members,
            departure,
        };
        on_joined(&outcome);
        Ok(outcome)
    }

    /// Remove a peer from its room. Idempotent.
    pub fn leave(&self, peer_id: &PeerId) -> Option<Departure> {
        let departure = self.lock().remove_member(peer_id);
        if let Some(departure) = &departure {
            debug!(
                room = %departure.room_id,
                peer = %peer_id,
                members = departure.remaining.len(),
                "Left room"
            );
        }
        departure
    }

    /// Snapshot of a room's members.
    #[must_use]
    pub fn members_of(&self, room_id: &str) -> HashSet<PeerId> {
        self.lock().rooms.get(room_id).cloned().unwrap_or_default()
    }

    /// Check whether a peer is a member of a room.
    #[must_use]
    pub fn is_member(&self, room_id: &str, peer_id: &PeerId) -> bool {
        self.lock()
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains(peer_id))
    }

    /// The room a peer is in, if any.
    #[must_use]
    pub fn room_of(&self, peer_id: &PeerId) -> Option<RoomId> {
        self.lock().membership.get(peer_id).cloned()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.lock().rooms.contains_key(room_id)
    }

    /// Get directory statistics.
    #[must_use]
    pub fn stats(&self) -> DirectoryStats {
        let state = self.lock();
        DirectoryStats {
            room_count: state.rooms.len(),
            member_count: state.membership.len(),
        }
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of peers that are in a room.
    pub member_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("10086").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("会议室").is_ok());
        assert!(validate_room_id("café 42").is_ok());
        assert!(validate_room_id("bad\nroom").is_err());
        assert!(validate_room_id("bad\u{85}room").is_err());
        // The length limit counts bytes, not characters.
        assert!(validate_room_id(&"会".repeat(86)).is_err());
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_join_returns_prior_members() {
        let directory = RoomDirectory::new();

        let first = directory.join("10086", &peer("a")).unwrap();
        assert!(first.prior_members.is_empty());
        assert!(directory.room_exists("10086"));

        let second = directory.join("10086", &peer("b")).unwrap();
        assert_eq!(second.prior_members, vec![peer("a")]);

        let mut third = directory.join("10086", &peer("c")).unwrap().prior_members;
        third.sort();
        assert_eq!(third, vec![peer("a"), peer("b")]);
    }

    #[test]
    fn test_join_moves_between_rooms() {
        let directory = RoomDirectory::new();
        directory.join("q", &peer("a")).unwrap();
        directory.join("q", &peer("b")).unwrap();

        let outcome = directory.join("r", &peer("a")).unwrap();
        let departure = outcome.departure.expect("left q");
        assert_eq!(departure.room_id, "q");
        assert_eq!(departure.remaining, vec![peer("b")]);
        assert!(!departure.room_closed);

        assert_eq!(directory.room_of(&peer("a")), Some("r".to_string()));
        assert!(!directory.members_of("q").contains(&peer("a")));
        assert!(directory.members_of("r").contains(&peer("a")));
    }

    #[test]
    fn test_rejoin_same_room_leaves_first() {
        let directory = RoomDirectory::new();
        directory.join("r", &peer("a")).unwrap();
        directory.join("r", &peer("b")).unwrap();

        let outcome = directory.join("r", &peer("a")).unwrap();
        let departure = outcome.departure.expect("implicit leave");
        assert_eq!(departure.room_id, "r");
        assert_eq!(departure.remaining, vec![peer("b")]);
        assert!(!departure.room_closed);
        assert_eq!(outcome.prior_members, vec![peer("b")]);
        assert_eq!(directory.members_of("r").len(), 2);
        assert_eq!(directory.room_of(&peer("a")), Some("r".to_string()));
    }

    #[test]
    fn test_rejoin_full_room() {
        let directory = RoomDirectory::with_config(DirectoryConfig {
            max_rooms: 1,
            max_peers_per_room: 1,
        });
        directory.join("r", &peer("a")).unwrap();

        let outcome = directory.join("r", &peer("a")).unwrap();
        assert!(outcome.departure.unwrap().room_closed);
        assert!(outcome.prior_members.is_empty());
        assert!(directory.is_member("r", &peer("a")));
    }

    #[test]
    fn test_leave_removes_empty_room() {
        let directory = RoomDirectory::new();
        directory.join("r", &peer("a")).unwrap();

        let departure = directory.leave(&peer("a")).unwrap();
        assert!(departure.room_closed);
        assert!(departure.remaining.is_empty());
        assert!(!directory.room_exists("r"));

        // Idempotent
        assert!(directory.leave(&peer("a")).is_none());
    }

    #[test]
    fn test_at_most_one_room() {
        let directory = RoomDirectory::new();
        let rooms = ["r1", "r2", "r3"];

        for step in 0..30 {
            let p = peer(&format!("p{}", step % 4));
            if step % 5 == 4 {
                directory.leave(&p);
            } else {
                directory.join(rooms[step % rooms.len()], &p).unwrap();
            }

            for i in 0..4 {
                let p = peer(&format!("p{i}"));
                let count = rooms
                    .iter()
                    .filter(|r| directory.members_of(r).contains(&p))
                    .count();
                assert!(count <= 1, "peer {p} is in {count} rooms");
            }
        }
    }

    #[test]
    fn test_limits() {
        let directory = RoomDirectory::with_config(DirectoryConfig {
            max_rooms: 2,
            max_peers_per_room: 1,
        });
        directory.join("r", &peer("a")).unwrap();
        directory.join("s", &peer("b")).unwrap();

        assert!(matches!(
            directory.join("r", &peer("c")),
            Err(DirectoryError::RoomFull(_))
        ));
        assert!(matches!(
            directory.join("other", &peer("c")),
            Err(DirectoryError::MaxRoomsReached)
        ));

        // A failed join keeps the existing membership.
        assert!(matches!(
            directory.join("s", &peer("a")),
            Err(DirectoryError::RoomFull(_))
        ));
        assert_eq!(directory.room_of(&peer("a")), Some("r".to_string()));
        assert!(directory.is_member("s", &peer("b")));
    }

    #[test]
    fn test_move_from_sole_member_room_at_room_limit() {
        let directory = RoomDirectory::with_config(DirectoryConfig {
            max_rooms: 1,
            max_peers_per_room: 4,
        });
        directory.join("q", &peer("a")).unwrap();

        // Leaving q closes it, so r fits under the limit.
        let outcome = directory.join("r", &peer("a")).unwrap();
        assert!(outcome.departure.unwrap().room_closed);
        assert!(!directory.room_exists("q"));
        assert!(directory.is_member("r", &peer("a")));
        assert_eq!(directory.stats().room_count, 1);

        // Someone else still cannot open a second room.
        assert!(matches!(
            directory.join("q", &peer("b")),
            Err(DirectoryError::MaxRoomsReached)
        ));
    }

    #[test]
    fn test_join_then_runs_under_lock() {
        let directory = RoomDirectory::new();
        directory.join("r", &peer("a")).unwrap();

        let mut seen = None;
        directory
            .join_then("r", &peer("b"), |outcome| {
                assert!(directory.state.try_lock().is_err());
                seen = Some(outcome.prior_members.clone());
            })
            .unwrap();
        assert_eq!(seen, Some(vec![peer("a")]));

        let mut called = false;
        assert!(directory.join_then("", &peer("c"), |_| called = true).is_err());
        assert!(!called);
    }

    #[test]
    fn test_unicode_room() {
        let directory = RoomDirectory::new();
        directory.join("会议室", &peer("a")).unwrap();
        assert!(directory.is_member("会议室", &peer("a")));
    }

    #[test]
    fn test_invalid_room() {
        let directory = RoomDirectory::new();
        let err = directory.join("", &peer("a")).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ROOM);
    }

    #[test]
    fn test_stats() {
        let directory = RoomDirectory::new();
        directory.join("r1", &peer("a")).unwrap();
        directory.join("r1", &peer("b")).unwrap();
        directory.join("r2", &peer("c")).unwrap();

        let stats = directory.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.member_count, 3);
    }
}
