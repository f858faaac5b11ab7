//! # parley-protocol
//!
//! Wire protocol definitions for the Parley signaling relay.
//!
//! Clients and the relay exchange [`Envelope`]s: tagged JSON objects in text
//! frames, or the same structure as MessagePack in binary frames.
//!
//! ## Envelope kinds
//!
//! - `join` / `joined` / `welcome` - Room membership and identity
//! - `newPeer` / `peerDisconnected` - Membership notifications
//! - `relaySessionDescription` / `iceCandidate` - Opaque negotiation payloads
//! - `message` - Chat
//! - `ping` / `pong` / `error` - Liveness and errors
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::join("10086");
//! let text = codec::encode_json(&envelope).unwrap();
//! assert_eq!(codec::decode_json(&text).unwrap(), envelope);
//! ```

pub mod codec;
pub mod envelope;
pub mod version;

pub use codec::{decode, encode, ProtocolError, WireFormat, WireMessage};
pub use envelope::{codes, Envelope, EnvelopeKind, PeerId, RoomId};
pub use version::{Version, PROTOCOL_VERSION};
