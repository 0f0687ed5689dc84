//! # relay-protocol
//!
//! Wire types for the Commz realtime relay.
//!
//! The relay pushes persisted chat messages to connected clients. This crate
//! defines the records the relay reads from the message store and the codecs
//! that turn them into frame payloads.
//!
//! ## Encodings
//!
//! - `Json` - text frames, the format browsers consume
//! - `MessagePack` - binary frames for native clients
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ChatMessage, Encoding};
//! use uuid::Uuid;
//!
//! let message = ChatMessage::new(Uuid::new_v4(), Uuid::new_v4(), "hello");
//!
//! let encoded = codec::encode_message(&message, Encoding::Json).unwrap();
//! let decoded = codec::decode_message(&encoded, Encoding::Json).unwrap();
//! assert_eq!(decoded.content, "hello");
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode_message, encode_message, Encoding, ProtocolError};
pub use message::{ChatMessage, Conversation, ConversationId, MessageId, UserId};
