//! MongoDB-backed message store.
//!
//! Reads the `messages` and `chats` collections the chat service writes.
//! That service stores UUIDs as 16-byte generic binary, so ids are decoded
//! from binary subtype `0x00` (subtype `0x04` is accepted too) and encoded the
//! same way in query filters.

use async_trait::async_trait;
use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use relay_core::{MessageStore, StoreError};
use relay_protocol::{ChatMessage, ConversationId, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;

const MESSAGES: &str = "messages";
const CHATS: &str = "chats";

/// Why a stored document could not be turned into a record.
#[derive(Debug, Error)]
enum DecodeError {
    #[error(transparent)]
    Bson(#[from] bson::de::Error),

    #[error("field `{0}` is not a UUID")]
    NotUuid(&'static str),
}

/// [`MessageStore`] over the chat service database.
#[derive(Debug, Clone)]
pub struct MongoStore {
    messages: Collection<Document>,
    chats: Collection<Document>,
}

impl MongoStore {
    /// Connect to the configured database and ensure the crawler's indexes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URI is invalid or no server
    /// answers within the connect timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.mongo_uri)
            .await
            .map_err(|e| StoreError::Unavailable(format!("invalid MongoDB URI: {e}")))?;
        options.app_name = Some("commz-relay".to_string());
        if options.server_selection_timeout.is_none() {
            options.server_selection_timeout =
                Some(Duration::from_millis(config.connect_timeout_ms));
        }

        let client = Client::with_options(options).map_err(store_error)?;
        let database = client.database(&config.database);
        let store = Self {
            messages: database.collection(MESSAGES),
            chats: database.collection(CHATS),
        };

        store.ensure_indexes().await?;
        info!(database = %config.database, "Connected to MongoDB");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        for keys in [doc! { "chat_id": 1 }, doc! { "updatedAt": -1 }] {
            self.messages
                .create_index(IndexModel::builder().keys(keys).build())
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MongoStore {
    async fn fetch_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let documents: Vec<Document> = self
            .messages
            .find(updated_since_filter(since))
            .sort(doc! { "updatedAt": -1 })
            .await
            .map_err(store_error)?
            .try_collect()
            .await
            .map_err(store_error)?;

        let messages: Vec<ChatMessage> = documents
            .into_iter()
            .filter_map(|document| match decode_message(document) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed message document");
                    None
                }
            })
            .collect();

        debug!(count = messages.len(), since = %since, "Fetched updated messages");
        Ok(messages)
    }

    async fn resolve_members(
        &self,
        conversations: &[ConversationId],
    ) -> Result<HashMap<ConversationId, Vec<UserId>>, StoreError> {
        if conversations.is_empty() {
            return Ok(HashMap::new());
        }

        let documents: Vec<Document> = self
            .chats
            .find(members_filter(conversations))
            .projection(doc! { "members": 1 })
            .await
            .map_err(store_error)?
            .try_collect()
            .await
            .map_err(store_error)?;

        let mut members = HashMap::with_capacity(documents.len());
        for document in documents {
            match decode_members(document) {
                Ok((id, users)) => {
                    members.insert(id, users);
                }
                Err(e) => warn!(error = %e, "Skipping malformed chat document"),
            }
        }
        Ok(members)
    }
}

fn store_error(e: mongodb::error::Error) -> StoreError {
    match e.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Query(e.to_string()),
    }
}

fn uuid_to_bson(id: &Uuid) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: id.as_bytes().to_vec(),
    })
}

fn uuid_from_binary(binary: &Binary, field: &'static str) -> Result<Uuid, DecodeError> {
    match binary.subtype {
        BinarySubtype::Generic | BinarySubtype::Uuid => {
            Uuid::from_slice(&binary.bytes).map_err(|_| DecodeError::NotUuid(field))
        }
        _ => Err(DecodeError::NotUuid(field)),
    }
}

fn uuids_from_binaries(
    binaries: Option<Vec<Binary>>,
    field: &'static str,
) -> Result<Vec<Uuid>, DecodeError> {
    binaries
        .unwrap_or_default()
        .iter()
        .map(|binary| uuid_from_binary(binary, field))
        .collect()
}

fn updated_since_filter(since: DateTime<Utc>) -> Document {
    doc! { "updatedAt": { "$gte": bson::DateTime::from_chrono(since) } }
}

fn members_filter(conversations: &[ConversationId]) -> Document {
    let ids: Vec<Bson> = conversations.iter().map(uuid_to_bson).collect();
    doc! { "_id": { "$in": ids } }
}

/// A `messages` document as the chat service writes it.
#[derive(Debug, Deserialize)]
struct MessageDocument {
    #[serde(rename = "_id")]
    id: Binary,
    #[serde(default)]
    content: String,
    #[serde(default)]
    command: String,
    sender: Binary,
    chat_id: Binary,
    #[serde(rename = "updatedAt")]
    updated_at: bson::DateTime,
    timestamp: bson::DateTime,
    #[serde(default)]
    media: Option<Vec<Binary>>,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    reply_to: Option<Binary>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct MembersDocument {
    #[serde(rename = "_id")]
    id: Binary,
    #[serde(default)]
    members: Option<Vec<Binary>>,
}

fn decode_message(document: Document) -> Result<ChatMessage, DecodeError> {
    let raw: MessageDocument = bson::from_document(document)?;

    Ok(ChatMessage {
        id: uuid_from_binary(&raw.id, "_id")?,
        content: raw.content,
        command: raw.command,
        sender_id: uuid_from_binary(&raw.sender, "sender")?,
        chat_id: uuid_from_binary(&raw.chat_id, "chat_id")?,
        updated_at: raw.updated_at.to_chrono(),
        timestamp: raw.timestamp.to_chrono(),
        media: uuids_from_binaries(raw.media, "media")?,
        read: raw.read,
        reply_to: raw
            .reply_to
            .as_ref()
            .map(|binary| uuid_from_binary(binary, "reply_to"))
            .transpose()?,
        deleted: raw.deleted,
    })
}

fn decode_members(document: Document) -> Result<(ConversationId, Vec<UserId>), DecodeError> {
    let raw: MembersDocument = bson::from_document(document)?;
    Ok((
        uuid_from_binary(&raw.id, "_id")?,
        uuids_from_binaries(raw.members, "members")?,
    ))
}
