//! Payload codecs for relayed messages.
//!
//! A relayed message is encoded once by the crawler and the resulting bytes
//! are shared by every recipient, so encoding is a pure function of the
//! message and the configured [`Encoding`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::ChatMessage;

/// Maximum encoded payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Payload encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON documents sent as text frames.
    #[default]
    Json,
    /// Named-field MessagePack sent as binary frames.
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl Encoding {
    /// Whether payloads in this encoding travel in binary frames.
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Encoding::MessagePack)
    }
}

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds maximum size.
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a message into a frame payload.
///
/// # Errors
///
/// Returns an error if serialization fails or the payload is too large.
pub fn encode_message(message: &ChatMessage, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    let payload = match encoding {
        Encoding::Json => serde_json::to_vec(message)?,
        Encoding::MessagePack => rmp_serde::to_vec_named(message)?,
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a frame payload back into a message.
///
/// # Errors
///
/// Returns an error if the payload is too large or malformed.
pub fn decode_message(data: &[u8], encoding: Encoding) -> Result<ChatMessage, ProtocolError> {
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }

    let message = match encoding {
        Encoding::Json => serde_json::from_slice(data)?,
        Encoding::MessagePack => rmp_serde::from_slice(data)?,
    };
    Ok(message)
}
