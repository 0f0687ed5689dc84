//! Shared fixtures for the relay benchmarks.

use bytes::Bytes;
use relay_core::hub::next_session_id;
use relay_core::{HubHandle, MemoryStore, Registration};
use relay_protocol::{ChatMessage, Conversation, UserId};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Single-threaded runtime; the hub loop and the benchmark share one thread.
#[must_use]
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// Register `count` bare sessions for `user`, returning their queues.
pub async fn attach_sessions(
    hub: &HubHandle,
    user: UserId,
    count: usize,
    capacity: usize,
) -> Vec<mpsc::Receiver<Bytes>> {
    let mut queues = Vec::with_capacity(count);
    for _ in 0..count {
        let (outbound, queue) = mpsc::channel(capacity);
        hub.register(Registration {
            id: next_session_id(),
            user_id: user,
            outbound,
        })
        .await
        .expect("hub stopped");
        queues.push(queue);
    }
    queues
}

/// Empty every queue.
pub fn drain(queues: &mut [mpsc::Receiver<Bytes>]) {
    for queue in queues {
        while queue.try_recv().is_ok() {}
    }
}

/// A store holding one conversation of `members` users and `messages`
/// messages in it.
#[must_use]
pub fn populated_store(members: &[UserId], messages: usize) -> MemoryStore {
    let store = MemoryStore::new();
    let creator = members.first().copied().unwrap_or_else(Uuid::new_v4);
    let conversation = Conversation::new(creator, members.iter().copied());
    let chat = conversation.id;
    store.upsert_conversation(conversation);

    for i in 0..messages {
        store.upsert_message(ChatMessage::new(creator, chat, format!("message {i}")));
    }
    store
}
