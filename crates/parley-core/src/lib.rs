//! # parley-core
//!
//! Room-based signaling relay core for Parley.
//!
//! This crate provides the building blocks of the relay:
//!
//! - **ConnectionRegistry** - Issues peer ids and tracks live connections
//! - **RoomDirectory** - Room membership with at most one room per peer
//! - **MessageRouter** - Per-connection state machine and relay dispatch
//! - **LivenessMonitor** - Heartbeats and eviction of dead connections
//! - **PeerLink** - Bounded outbound queue per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────┐     ┌────────────────────┐
//! │  Connection │────▶│ MessageRouter │────▶│ ConnectionRegistry │
//! └─────────────┘     └───────────────┘     └────────────────────┘
//!        ▲                    │                       ▲
//!        │ Outbox             ▼                       │
//!        │            ┌───────────────┐     ┌─────────────────┐
//!        └────────────│ RoomDirectory │     │ LivenessMonitor │
//!                     └───────────────┘     └─────────────────┘
//! ```

pub mod directory;
pub mod link;
pub mod liveness;
pub mod registry;
pub mod router;

pub use directory::{Departure, DirectoryConfig, DirectoryError, JoinOutcome, RoomDirectory};
pub use link::{Eviction, Outbox, PeerLink, SendError};
pub use liveness::{LivenessConfig, LivenessMonitor, SweepReport};
pub use registry::ConnectionRegistry;
pub use router::{MessageRouter, RouteError, RouterConfig, RouterStats, Session, SessionState};
