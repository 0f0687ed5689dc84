//! Message store abstraction.
//!
//! The crawler only needs two queries from the backing database: messages
//! changed since a point in time, and the members of a set of conversations.
//! [`MemoryStore`] answers both from in-process maps and backs tests and
//! benches; the server binary reads MongoDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_protocol::{ChatMessage, Conversation, ConversationId, MessageId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),
}

/// Read access to persisted messages and conversations.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages whose `updated_at` is at or after `since`, newest first.
    async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Members of each known conversation in `conversations`.
    ///
    /// Unknown conversation IDs are absent from the result.
    async fn resolve_members(
        &self,
        conversations: &[ConversationId],
    ) -> Result<HashMap<ConversationId, Vec<UserId>>, StoreError>;
}

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        (**self).fetch_updated_since(since).await
    }

    async fn resolve_members(
        &self,
        conversations: &[ConversationId],
    ) -> Result<HashMap<ConversationId, Vec<UserId>>, StoreError> {
        (**self).resolve_members(conversations).await
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<MessageId, ChatMessage>,
    conversations: DashMap<ConversationId, Conversation>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a message, keyed by its ID.
    pub fn upsert_message(&self, message: ChatMessage) {
        self.messages.insert(message.id, message);
    }

    /// Insert or replace a conversation, keyed by its ID.
    pub fn upsert_conversation(&self, conversation: Conversation) {
        self.conversations.insert(conversation.id, conversation);
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|entry| entry.updated_at >= since)
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(messages)
    }

    async fn resolve_members(
        &self,
        conversations: &[ConversationId],
    ) -> Result<HashMap<ConversationId, Vec<UserId>>, StoreError> {
        Ok(conversations
            .iter()
            .filter_map(|id| {
                self.conversations
                    .get(id)
                    .map(|conversation| (*id, conversation.members.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fetch_is_inclusive_and_newest_first() {
        let store = MemoryStore::new();
        let chat = Uuid::new_v4();
        let t0 = Utc::now();

        for offset in [0, 2, 1] {
            store.upsert_message(
                ChatMessage::new(Uuid::new_v4(), chat, format!("m{offset}"))
                    .with_updated_at(t0 + Duration::seconds(offset)),
            );
        }
        store.upsert_message(
            ChatMessage::new(Uuid::new_v4(), chat, "old")
                .with_updated_at(t0 - Duration::seconds(5)),
        );

        let fetched = store.fetch_updated_since(t0).await.unwrap();
        let contents: Vec<&str> = fetched.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m1", "m0"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_edited_message() {
        let store = MemoryStore::new();
        let mut message = ChatMessage::new(Uuid::new_v4(), Uuid::new_v4(), "draft");
        store.upsert_message(message.clone());

        message.content = "edited".to_string();
        store.upsert_message(message);

        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_members_skips_unknown() {
        let store = MemoryStore::new();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let conversation = Conversation::new(u1, vec![u1, u2]);
        let known = conversation.id;
        store.upsert_conversation(conversation);

        let unknown = Uuid::new_v4();
        let members = store.resolve_members(&[known, unknown]).await.unwrap();

        assert_eq!(members.len(), 1);
        assert_eq!(members[&known], vec![u1, u2]);
    }

    #[tokio::test]
    async fn test_shared_store_through_arc() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_message(ChatMessage::new(Uuid::new_v4(), Uuid::new_v4(), "hi"));

        let dynamic: Arc<dyn MessageStore> = store.clone();
        let fetched = dynamic
            .fetch_updated_since(Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
    }
}
