//! Change-feed crawler.
//!
//! The crawler polls the message store for messages changed since its
//! checkpoint and hands each one to the hub, addressed to the members of the
//! message's conversation.
//!
//! One cycle:
//!
//! 1. note the cycle start time
//! 2. fetch messages updated at or after the checkpoint (newest first)
//! 3. resolve members of every distinct conversation in one query
//! 4. submit one fan-out per message in chronological order
//! 5. move the checkpoint to the cycle start, minus the skew margin
//!
//! A failed query leaves the checkpoint alone so the next cycle retries the
//! same window. Messages can therefore be relayed more than once; clients
//! deduplicate by message ID.

use chrono::{DateTime, Utc};
use relay_protocol::{encode_message, ConversationId, Encoding};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::hub::{FanOutRequest, HubHandle};
use crate::store::{MessageStore, StoreError};
use crate::telemetry;

/// Crawler errors.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Failed to fetch updated messages: {0}")]
    Fetch(#[source] StoreError),

    #[error("Failed to resolve conversation members: {0}")]
    Members(#[source] StoreError),

    #[error("Hub is not running")]
    HubClosed,
}

impl CrawlError {
    /// Stable label used in metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::Fetch(_) => "fetch",
            CrawlError::Members(_) => "members",
            CrawlError::HubClosed => "hub_closed",
        }
    }
}

/// Crawler configuration.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Subtracted from the cycle start when advancing the checkpoint, to
    /// tolerate clock skew between the relay and the database.
    pub skew_margin: Duration,
    /// Wire encoding of relayed payloads.
    pub encoding: Encoding,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            skew_margin: Duration::ZERO,
            encoding: Encoding::Json,
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages returned by the store.
    pub fetched: usize,
    /// Fan-out requests handed to the hub.
    pub submitted: usize,
    /// Messages dropped for lack of members or encoding failure.
    pub skipped: usize,
}

/// Polls a [`MessageStore`] and feeds the hub.
pub struct Crawler<S> {
    store: S,
    hub: HubHandle,
    config: CrawlerConfig,
    checkpoint: DateTime<Utc>,
}

impl<S: MessageStore> Crawler<S> {
    /// Create a crawler whose checkpoint starts now.
    pub fn new(store: S, hub: HubHandle, config: CrawlerConfig) -> Self {
        Self {
            store,
            hub,
            config,
            checkpoint: Utc::now(),
        }
    }

    /// Start from an explicit checkpoint instead of now.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: DateTime<Utc>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Lower bound of the next fetch.
    #[must_use]
    pub fn checkpoint(&self) -> DateTime<Utc> {
        self.checkpoint
    }

    /// Run one cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if a store query fails (the checkpoint is kept) or
    /// the hub has stopped.
    pub async fn poll_once(&mut self) -> Result<CycleReport, CrawlError> {
        let cycle_start = Utc::now();

        let mut messages = self
            .store
            .fetch_updated_since(self.checkpoint)
            .await
            .map_err(CrawlError::Fetch)?;

        let mut report = CycleReport {
            fetched: messages.len(),
            ..CycleReport::default()
        };

        if !messages.is_empty() {
            let mut conversations: Vec<ConversationId> =
                messages.iter().map(|m| m.chat_id).collect();
            conversations.sort_unstable();
            conversations.dedup();

            let members = self
                .store
                .resolve_members(&conversations)
                .await
                .map_err(CrawlError::Members)?;

            // The store returns newest first.
            messages.reverse();

            for message in &messages {
                let recipients = match members.get(&message.chat_id) {
                    Some(recipients) if !recipients.is_empty() => recipients,
                    _ => {
                        debug!(message_id = %message.id, chat = %message.chat_id, "No members for conversation, skipping");
                        report.skipped += 1;
                        continue;
                    }
                };

                let payload = match encode_message(message, self.config.encoding) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(message_id = %message.id, error = %e, "Failed to encode message, skipping");
                        report.skipped += 1;
                        continue;
                    }
                };

                trace!(
                    message_id = %message.id,
                    chat = %message.chat_id,
                    recipients = recipients.len(),
                    "Relaying message"
                );
                self.hub
                    .broadcast(FanOutRequest::new(payload, recipients.iter().copied()))
                    .await
                    .map_err(|_| CrawlError::HubClosed)?;
                report.submitted += 1;
            }
        }

        self.advance(cycle_start);
        Ok(report)
    }

    fn advance(&mut self, cycle_start: DateTime<Utc>) {
        let margin = chrono::Duration::from_std(self.config.skew_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let next = cycle_start - margin;
        if next > self.checkpoint {
            self.checkpoint = next;
        }
    }

    /// Poll every interval until `shutdown` flips to `true` or the hub stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            checkpoint = %self.checkpoint,
            "Crawler started"
        );

        loop {
            let stopping = *shutdown.borrow_and_update();
            if stopping {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let started = Instant::now();
            match self.poll_once().await {
                Ok(report) => {
                    telemetry::record_crawl_cycle(started.elapsed(), report.submitted);
                    if report.fetched > 0 {
                        debug!(
                            fetched = report.fetched,
                            submitted = report.submitted,
                            skipped = report.skipped,
                            "Crawl cycle complete"
                        );
                    }
                }
                Err(CrawlError::HubClosed) => {
                    telemetry::record_crawl_error(CrawlError::HubClosed.kind());
                    warn!("Hub stopped, crawler exiting");
                    break;
                }
                Err(e) => {
                    telemetry::record_crawl_error(e.kind());
                    error!(error = %e, checkpoint = %self.checkpoint, "Crawl cycle failed, retrying next tick");
                }
            }
        }

        info!("Crawler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{next_session_id, Hub, HubConfig, Registration, SessionId};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use relay_protocol::{decode_message, ChatMessage, Conversation, UserId};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn attach(hub: &HubHandle, user_id: UserId) -> (SessionId, mpsc::Receiver<Bytes>) {
        let (outbound, queue) = mpsc::channel(64);
        let id = next_session_id();
        hub.register(Registration {
            id,
            user_id,
            outbound,
        })
        .await
        .unwrap();
        (id, queue)
    }

    /// Wait until the hub has processed every broadcast queued so far.
    async fn flush(hub: &HubHandle) {
        hub.broadcast_with_report(FanOutRequest::new(Bytes::new(), Vec::<UserId>::new()))
            .await
            .unwrap();
    }

    fn drain(queue: &mut mpsc::Receiver<Bytes>) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        while let Ok(payload) = queue.try_recv() {
            messages.push(decode_message(&payload, Encoding::Json).unwrap());
        }
        messages
    }

    /// Wraps a [`MemoryStore`] and can be told to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_fetch: AtomicBool,
        fail_members: AtomicBool,
        fetches: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn fetch_updated_since(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            self.fetches.lock().unwrap().push(since);
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.fetch_updated_since(since).await
        }

        async fn resolve_members(
            &self,
            conversations: &[ConversationId],
        ) -> Result<HashMap<ConversationId, Vec<UserId>>, StoreError> {
            if self.fail_members.load(Ordering::SeqCst) {
                return Err(StoreError::Query("timeout".into()));
            }
            self.inner.resolve_members(conversations).await
        }
    }

    #[tokio::test]
    async fn test_new_message_reaches_conversation_members() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let (_, mut q1) = attach(&hub, u1).await;
        let (_, mut q2) = attach(&hub, u2).await;
        let (_, mut q3) = attach(&hub, u3).await;

        let conversation = Conversation::new(u1, [u1, u2]);
        let chat = conversation.id;
        store.upsert_conversation(conversation);

        let start = Utc::now() - ChronoDuration::seconds(1);
        let mut crawler = Crawler::new(store.clone(), hub.clone(), CrawlerConfig::default())
            .with_checkpoint(start);

        let message = ChatMessage::new(u2, chat, "hello");
        store.upsert_message(message.clone());

        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report, CycleReport { fetched: 1, submitted: 1, skipped: 0 });
        assert!(crawler.checkpoint() >= start);

        flush(&hub).await;
        assert_eq!(drain(&mut q1), vec![message.clone()]);
        assert_eq!(drain(&mut q2), vec![message]);
        assert!(drain(&mut q3).is_empty());
    }

    #[tokio::test]
    async fn test_messages_relayed_in_chronological_order() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let (_, mut queue) = attach(&hub, user).await;

        let conversation = Conversation::new(user, [user]);
        let chat = conversation.id;
        store.upsert_conversation(conversation);

        let base = Utc::now() - ChronoDuration::seconds(30);
        for offset in [3, 1, 4, 2, 5] {
            store.upsert_message(
                ChatMessage::new(user, chat, format!("m{offset}"))
                    .with_updated_at(base + ChronoDuration::seconds(offset)),
            );
        }

        let mut crawler =
            Crawler::new(store, hub.clone(), CrawlerConfig::default()).with_checkpoint(base);
        crawler.poll_once().await.unwrap();
        flush(&hub).await;

        let contents: Vec<String> = drain(&mut queue).into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn test_member_failure_keeps_checkpoint() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(FlakyStore::default());
        let user = Uuid::new_v4();
        let (_, mut queue) = attach(&hub, user).await;

        let conversation = Conversation::new(user, [user]);
        let chat = conversation.id;
        store.inner.upsert_conversation(conversation);
        store.inner.upsert_message(ChatMessage::new(user, chat, "retry me"));

        let start = Utc::now() - ChronoDuration::seconds(1);
        let mut crawler = Crawler::new(store.clone(), hub.clone(), CrawlerConfig::default())
            .with_checkpoint(start);

        store.fail_members.store(true, Ordering::SeqCst);
        let err = crawler.poll_once().await.unwrap_err();
        assert!(matches!(err, CrawlError::Members(_)));
        assert_eq!(crawler.checkpoint(), start);

        store.fail_members.store(false, Ordering::SeqCst);
        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report.submitted, 1);

        let fetches = store.fetches.lock().unwrap().clone();
        assert_eq!(fetches, vec![start, start]);

        flush(&hub).await;
        assert_eq!(drain(&mut queue).len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_checkpoint() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(FlakyStore::default());
        store.fail_fetch.store(true, Ordering::SeqCst);

        let start = Utc::now() - ChronoDuration::seconds(1);
        let mut crawler =
            Crawler::new(store, hub, CrawlerConfig::default()).with_checkpoint(start);

        let err = crawler.poll_once().await.unwrap_err();
        assert!(matches!(err, CrawlError::Fetch(_)));
        assert_eq!(err.kind(), "fetch");
        assert_eq!(crawler.checkpoint(), start);
    }

    #[tokio::test]
    async fn test_conversation_without_members_is_skipped() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();

        let empty = Conversation::new(user, Vec::<UserId>::new());
        let empty_chat = empty.id;
        store.upsert_conversation(empty);
        store.upsert_message(ChatMessage::new(user, empty_chat, "nobody"));
        store.upsert_message(ChatMessage::new(user, Uuid::new_v4(), "unknown chat"));

        let mut crawler = Crawler::new(store, hub, CrawlerConfig::default())
            .with_checkpoint(Utc::now() - ChronoDuration::seconds(1));

        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report, CycleReport { fetched: 2, submitted: 0, skipped: 2 });
    }

    #[tokio::test]
    async fn test_empty_cycle_advances_checkpoint() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let start = Utc::now() - ChronoDuration::minutes(5);
        let mut crawler = Crawler::new(MemoryStore::new(), hub, CrawlerConfig::default())
            .with_checkpoint(start);

        let before = Utc::now();
        let report = crawler.poll_once().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert!(crawler.checkpoint() >= before);
    }

    #[tokio::test]
    async fn test_skew_margin_holds_checkpoint_back() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let config = CrawlerConfig {
            skew_margin: Duration::from_secs(5),
            ..CrawlerConfig::default()
        };
        let start = Utc::now() - ChronoDuration::minutes(1);
        let mut crawler = Crawler::new(MemoryStore::new(), hub, config).with_checkpoint(start);

        crawler.poll_once().await.unwrap();
        let checkpoint = crawler.checkpoint();
        assert!(checkpoint <= Utc::now() - ChronoDuration::seconds(5));
        assert!(checkpoint > start);
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let config = CrawlerConfig {
            skew_margin: Duration::from_secs(3600),
            ..CrawlerConfig::default()
        };
        let start = Utc::now();
        let mut crawler = Crawler::new(MemoryStore::new(), hub, config).with_checkpoint(start);

        crawler.poll_once().await.unwrap();
        assert_eq!(crawler.checkpoint(), start);
    }

    #[tokio::test]
    async fn test_msgpack_encoding() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let (_, mut queue) = attach(&hub, user).await;

        let conversation = Conversation::new(user, [user]);
        let chat = conversation.id;
        store.upsert_conversation(conversation);
        let message = ChatMessage::new(user, chat, "packed");
        store.upsert_message(message.clone());

        let config = CrawlerConfig {
            encoding: Encoding::MessagePack,
            ..CrawlerConfig::default()
        };
        let mut crawler = Crawler::new(store, hub.clone(), config)
            .with_checkpoint(Utc::now() - ChronoDuration::seconds(1));
        crawler.poll_once().await.unwrap();
        flush(&hub).await;

        let payload = queue.try_recv().unwrap();
        assert_eq!(decode_message(&payload, Encoding::MessagePack).unwrap(), message);
    }

    #[tokio::test]
    async fn test_hub_closed_stops_cycle() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let conversation = Conversation::new(user, [user]);
        let chat = conversation.id;
        store.upsert_conversation(conversation);
        store.upsert_message(ChatMessage::new(user, chat, "late"));

        hub.shutdown().await.unwrap();
        task.await.unwrap();

        let start = Utc::now() - ChronoDuration::seconds(1);
        let mut crawler =
            Crawler::new(store, hub, CrawlerConfig::default()).with_checkpoint(start);
        assert!(matches!(
            crawler.poll_once().await,
            Err(CrawlError::HubClosed)
        ));
        assert_eq!(crawler.checkpoint(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_relays_and_stops_on_shutdown() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let (_, mut queue) = attach(&hub, user).await;

        let conversation = Conversation::new(user, [user]);
        let chat = conversation.id;
        store.upsert_conversation(conversation);

        let crawler = Crawler::new(store.clone(), hub.clone(), CrawlerConfig::default())
            .with_checkpoint(Utc::now() - ChronoDuration::seconds(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(crawler.run(shutdown_rx));

        store.upsert_message(ChatMessage::new(user, chat, "tick"));
        let payload = queue.recv().await.unwrap();
        let message = decode_message(&payload, Encoding::Json).unwrap();
        assert_eq!(message.content, "tick");

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }
}
