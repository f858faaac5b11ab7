//! Codec for encoding and decoding Parley envelopes.
//!
//! Text frames carry JSON, binary frames carry the same envelope as
//! MessagePack with named fields. Decoding goes through a generic value first
//! so an unknown `type` can be told apart from a malformed message.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{codes, Envelope, EnvelopeKind};

/// Maximum message size accepted by the codec (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    MessagePack,
}

/// A single transport message, before decoding or after encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    /// The format implied by the frame type.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        match self {
            WireMessage::Text(_) => WireFormat::Json,
            WireMessage::Binary(_) => WireFormat::MessagePack,
        }
    }

    /// Size of the message body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(data) => data.len(),
        }
    }

    /// Check whether the message body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds the size limit.
    #[error("Message size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Message body is not valid JSON / MessagePack.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Message has no string `type` field.
    #[error("Message has no type")]
    MissingType,

    /// Message `type` names no known envelope kind.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known `type` but fields do not match.
    #[error("Invalid {kind} envelope: {reason}")]
    Invalid { kind: EnvelopeKind, reason: String },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    EncodeMsgpack(#[from] rmp_serde::encode::Error),
}

impl ProtocolError {
    /// Wire error code to report back to the sender.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ProtocolError::UnknownType(_) => codes::UNKNOWN_KIND,
            _ => codes::MALFORMED,
        }
    }
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Encode an envelope as MessagePack.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_msgpack(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?))
}

/// Encode an envelope in the given format.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope, format: WireFormat) -> Result<WireMessage, ProtocolError> {
    match format {
        WireFormat::Json => encode_json(envelope).map(WireMessage::Text),
        WireFormat::MessagePack => encode_msgpack(envelope).map(WireMessage::Binary),
    }
}

/// Decode a JSON text envelope.
///
/// # Errors
///
/// Returns an error if the text is too large, unparseable, or not an envelope.
pub fn decode_json(text: &str) -> Result<Envelope, ProtocolError> {
    check_size(text.len())?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decode a MessagePack envelope.
///
/// # Errors
///
/// Returns an error if the data is too large, unparseable, or not an envelope.
pub fn decode_msgpack(data: &[u8]) -> Result<Envelope, ProtocolError> {
    check_size(data.len())?;
    let value: Value =
        rmp_serde::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    decode_value(value)
}

/// Decode a transport message.
///
/// # Errors
///
/// See [`decode_json`] and [`decode_msgpack`].
pub fn decode(message: &WireMessage) -> Result<Envelope, ProtocolError> {
    match message {
        WireMessage::Text(text) => decode_json(text),
        WireMessage::Binary(data) => decode_msgpack(data),
    }
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

fn decode_value(value: Value) -> Result<Envelope, ProtocolError> {
    let tag = match value.get("type") {
        Some(Value::String(tag)) => tag.clone(),
        _ => return Err(ProtocolError::MissingType),
    };
    let kind = EnvelopeKind::from_tag(&tag).ok_or(ProtocolError::UnknownType(tag))?;

    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid {
        kind,
        reason: e.to_string(),
    })
}
