//! Records read from the message store.
//!
//! Field names follow the JSON documents the chat service persists, so a
//! message relayed to a client is byte-for-byte what the REST API returns for
//! the same message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Identifier of an authenticated user.
pub type UserId = Uuid;

/// Identifier of a conversation (a direct chat or a group).
pub type ConversationId = Uuid;

/// Identifier of a chat message.
pub type MessageId = Uuid;

/// A chat message as stored by the chat service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message ID.
    pub id: MessageId,
    /// Message text.
    pub content: String,
    /// Optional slash command the message was created with.
    #[serde(default)]
    pub command: String,
    /// Author of the message.
    #[serde(rename = "sender")]
    pub sender_id: UserId,
    /// Conversation the message belongs to.
    pub chat_id: ConversationId,
    /// Last modification time (creation, edit or deletion).
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Attached media object IDs.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub media: Vec<Uuid>,
    /// Whether the message has been read.
    #[serde(default)]
    pub read: bool,
    /// Message this one replies to.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted: bool,
}

impl ChatMessage {
    /// Create a new message stamped with the current time.
    #[must_use]
    pub fn new(sender_id: UserId, chat_id: ConversationId, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            command: String::new(),
            sender_id,
            chat_id,
            updated_at: now,
            timestamp: now,
            media: Vec::new(),
            read: false,
            reply_to: None,
            deleted: false,
        }
    }

    /// Override the update timestamp.
    #[must_use]
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }
}

/// A conversation and its current members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation ID.
    pub id: ConversationId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Users allowed to read the conversation.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub members: Vec<UserId>,
    /// Creator of the conversation.
    pub creator_id: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last message.
    pub last_active: DateTime<Utc>,
}

impl Conversation {
    /// Create a conversation owned by `creator_id` with the given members.
    #[must_use]
    pub fn new(creator_id: UserId, members: impl IntoIterator<Item = UserId>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            members: members.into_iter().collect(),
            creator_id,
            created_at: now,
            last_active: now,
        }
    }
}

// The chat service writes `null` for empty lists.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
