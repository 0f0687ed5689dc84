//! The connection hub.
//!
//! The hub owns the set of live sessions. Every mutation and every iteration
//! of that set happens inside [`Hub::run`], a single task fed by four
//! channels:
//!
//! - **register** - a new session joins the live set
//! - **unregister** - a session leaves; its outbound queue is closed
//! - **broadcast** - a payload is fanned out to the sessions of a user set
//! - **control** - membership queries and shutdown
//!
//! Each channel is FIFO. No ordering is promised between channels.
//!
//! Enqueueing never blocks the loop: a session whose outbound queue is full
//! is evicted so that one slow reader cannot delay everyone else.

use bytes::Bytes;
use relay_protocol::UserId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::telemetry;

/// Opaque per-connection identifier.
pub type SessionId = u64;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique session ID.
#[must_use]
pub fn next_session_id() -> SessionId {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop has stopped.
    #[error("Hub is not running")]
    Closed,
}

/// A payload and the users it is addressed to.
#[derive(Debug, Clone)]
pub struct FanOutRequest {
    payload: Bytes,
    recipients: HashSet<UserId>,
}

impl FanOutRequest {
    /// Create a new fan-out request.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>, recipients: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            payload: payload.into(),
            recipients: recipients.into_iter().collect(),
        }
    }

    /// Get the encoded payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the recipient set.
    #[must_use]
    pub fn recipients(&self) -> &HashSet<UserId> {
        &self.recipients
    }
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Sessions whose queue accepted the payload.
    pub delivered: usize,
    /// Sessions dropped because their queue was full or closed.
    pub evicted: usize,
}

/// Hub statistics, published by the loop after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live sessions.
    pub sessions: usize,
    /// Payloads handed to session queues since start.
    pub delivered: u64,
    /// Sessions evicted for backpressure since start.
    pub evicted: u64,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the register and unregister request channels.
    pub request_capacity: usize,
    /// Capacity of the broadcast request channel.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            broadcast_capacity: 1024,
        }
    }
}

/// A session as handed to the hub.
#[derive(Debug)]
pub struct Registration {
    /// Session ID.
    pub id: SessionId,
    /// Authenticated user behind the session.
    pub user_id: UserId,
    /// Producer side of the session's outbound queue.
    ///
    /// The hub must hold the only sender: dropping it closes the queue.
    pub outbound: mpsc::Sender<Bytes>,
}

struct Member {
    user_id: UserId,
    outbound: mpsc::Sender<Bytes>,
}

struct BroadcastCommand {
    request: FanOutRequest,
    reply: Option<oneshot::Sender<FanOutReport>>,
}

enum Control {
    Contains {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// The hub control loop. Create with [`Hub::new`] and drive with [`Hub::run`].
pub struct Hub {
    register_rx: mpsc::Receiver<(Registration, oneshot::Sender<()>)>,
    unregister_rx: mpsc::Receiver<(SessionId, oneshot::Sender<bool>)>,
    broadcast_rx: mpsc::Receiver<BroadcastCommand>,
    control_rx: mpsc::Receiver<Control>,
    members: HashMap<SessionId, Member>,
    stats: HubStats,
    stats_tx: watch::Sender<HubStats>,
}

impl Hub {
    /// Create a hub and the handle used to talk to it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(config.request_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.request_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);
        let (control_tx, control_rx) = mpsc::channel(config.request_capacity);
        let (stats_tx, stats_rx) = watch::channel(HubStats::default());

        let hub = Self {
            register_rx,
            unregister_rx,
            broadcast_rx,
            control_rx,
            members: HashMap::new(),
            stats: HubStats::default(),
            stats_tx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            control_tx,
            stats_rx,
        };
        (hub, handle)
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Run the control loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                Some((registration, ack)) = self.register_rx.recv() => {
                    self.register(registration);
                    let _ = ack.send(());
                }
                Some((id, ack)) = self.unregister_rx.recv() => {
                    let removed = self.remove(id);
                    if removed {
                        debug!(session = id, sessions = self.members.len(), "Session unregistered");
                    }
                    let _ = ack.send(removed);
                }
                Some(command) = self.broadcast_rx.recv() => {
                    let report = self.broadcast(&command.request);
                    if let Some(reply) = command.reply {
                        let _ = reply.send(report);
                    }
                }
                Some(control) = self.control_rx.recv() => match control {
                    Control::Contains { id, reply } => {
                        let _ = reply.send(self.members.contains_key(&id));
                    }
                    Control::Shutdown { reply } => {
                        let closed = self.close_all();
                        let _ = reply.send(closed);
                        break;
                    }
                },
                else => break,
            }
        }

        self.close_all();
        info!("Hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            user_id,
            outbound,
        } = registration;
        self.members.insert(id, Member { user_id, outbound });
        self.publish_stats();

        debug!(session = id, user = %user_id, sessions = self.members.len(), "Session registered");
    }

    /// Remove a session, dropping its queue sender. Returns `false` if absent.
    fn remove(&mut self, id: SessionId) -> bool {
        let removed = self.members.remove(&id).is_some();
        if removed {
            self.publish_stats();
        }
        removed
    }

    fn broadcast(&mut self, request: &FanOutRequest) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut evicted = Vec::new();

        for (id, member) in &self.members {
            if !request.recipients.contains(&member.user_id) {
                continue;
            }

            match member.outbound.try_send(request.payload.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    trace!(session = id, user = %member.user_id, "Payload queued");
                }
                Err(TrySendError::Full(_)) => {
                    warn!(session = id, user = %member.user_id, "Send queue full, evicting session");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = id, user = %member.user_id, "Send queue closed, dropping session");
                    evicted.push(*id);
                }
            }
        }

        for id in &evicted {
            self.members.remove(id);
        }
        report.evicted = evicted.len();

        self.stats.delivered += report.delivered as u64;
        self.stats.evicted += report.evicted as u64;
        self.publish_stats();
        telemetry::record_fan_out(report.delivered, report.evicted);

        trace!(
            recipients = request.recipients.len(),
            delivered = report.delivered,
            evicted = report.evicted,
            "Broadcast complete"
        );
        report
    }

    fn close_all(&mut self) -> usize {
        let closed = self.members.len();
        self.members.clear();
        self.publish_stats();
        if closed > 0 {
            info!(sessions = closed, "Closed all sessions");
        }
        closed
    }

    fn publish_stats(&mut self) {
        self.stats.sessions = self.members.len();
        telemetry::set_active_sessions(self.stats.sessions);
        self.stats_tx.send_replace(self.stats);
    }
}

/// Cloneable handle for submitting requests to the hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<(Registration, oneshot::Sender<()>)>,
    unregister_tx: mpsc::Sender<(SessionId, oneshot::Sender<bool>)>,
    broadcast_tx: mpsc::Sender<BroadcastCommand>,
    control_tx: mpsc::Sender<Control>,
    stats_rx: watch::Receiver<HubStats>,
}

impl HubHandle {
    /// Add a session to the live set.
    ///
    /// Returns once the hub has processed the registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn register(&self, registration: Registration) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send((registration, ack))
            .await
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Remove a session and close its outbound queue.
    ///
    /// Safe to call any number of times. Returns `true` only for the call
    /// that actually removed the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn unregister(&self, id: SessionId) -> Result<bool, HubError> {
        let (ack, done) = oneshot::channel();
        self.unregister_tx
            .send((id, ack))
            .await
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Queue a fan-out request.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn broadcast(&self, request: FanOutRequest) -> Result<(), HubError> {
        self.broadcast_tx
            .send(BroadcastCommand {
                request,
                reply: None,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Fan out a request and wait for the delivery report.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn broadcast_with_report(
        &self,
        request: FanOutRequest,
    ) -> Result<FanOutReport, HubError> {
        let (reply, report) = oneshot::channel();
        self.broadcast_tx
            .send(BroadcastCommand {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| HubError::Closed)?;
        report.await.map_err(|_| HubError::Closed)
    }

    /// Check whether a session is in the live set.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn contains(&self, id: SessionId) -> Result<bool, HubError> {
        let (reply, answer) = oneshot::channel();
        self.control_tx
            .send(Control::Contains { id, reply })
            .await
            .map_err(|_| HubError::Closed)?;
        answer.await.map_err(|_| HubError::Closed)
    }

    /// Close every session and stop the hub.
    ///
    /// Returns the number of sessions that were closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has already stopped.
    pub async fn shutdown(&self) -> Result<usize, HubError> {
        let (reply, closed) = oneshot::channel();
        self.control_tx
            .send(Control::Shutdown { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        closed.await.map_err(|_| HubError::Closed)
    }

    /// Latest published statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        *self.stats_rx.borrow()
    }

    /// Whether the hub loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.broadcast_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn attach(
        hub: &HubHandle,
        user_id: UserId,
        capacity: usize,
    ) -> (SessionId, mpsc::Receiver<Bytes>) {
        let (outbound, queue) = mpsc::channel(capacity);
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

    #[tokio::test]
    async fn test_register_unregister() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let user = Uuid::new_v4();

        let (id, _queue) = attach(&hub, user, 4).await;
        assert!(hub.contains(id).await.unwrap());
        assert_eq!(hub.stats().sessions, 1);

        assert!(hub.unregister(id).await.unwrap());
        assert!(!hub.contains(id).await.unwrap());
        assert_eq!(hub.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_harmless() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (a, _qa) = attach(&hub, Uuid::new_v4(), 4).await;
        let (b, _qb) = attach(&hub, Uuid::new_v4(), 4).await;

        assert!(hub.unregister(a).await.unwrap());
        assert!(!hub.unregister(a).await.unwrap());

        assert!(hub.contains(b).await.unwrap());
        assert_eq!(hub.stats().sessions, 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_queue() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (id, mut queue) = attach(&hub, Uuid::new_v4(), 4).await;

        hub.unregister(id).await.unwrap();
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_exact_recipients() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let users: Vec<UserId> = (0..4).map(|_| Uuid::new_v4()).collect();

        let mut queues = Vec::new();
        for user in &users {
            queues.push(attach(&hub, *user, 4).await.1);
        }

        let report = hub
            .broadcast_with_report(FanOutRequest::new(
                Bytes::from_static(b"payload"),
                [users[0], users[2]],
            ))
            .await
            .unwrap();
        assert_eq!(report, FanOutReport { delivered: 2, evicted: 0 });

        assert_eq!(queues[0].try_recv().unwrap(), Bytes::from_static(b"payload"));
        assert!(queues[1].try_recv().is_err());
        assert_eq!(queues[2].try_recv().unwrap(), Bytes::from_static(b"payload"));
        assert!(queues[3].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_user_on_two_devices() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();

        let (_, mut phone) = attach(&hub, u1, 4).await;
        let (_, mut laptop) = attach(&hub, u1, 4).await;
        let (_, mut other) = attach(&hub, u2, 4).await;

        hub.broadcast_with_report(FanOutRequest::new(Bytes::from_static(b"hello"), [u1]))
            .await
            .unwrap();

        assert_eq!(phone.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(laptop.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_evicts_session() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let user = Uuid::new_v4();
        let (id, mut queue) = attach(&hub, user, 2).await;

        for _ in 0..2 {
            let report = hub
                .broadcast_with_report(FanOutRequest::new(Bytes::from_static(b"x"), [user]))
                .await
                .unwrap();
            assert_eq!(report.delivered, 1);
        }

        let report = hub
            .broadcast_with_report(FanOutRequest::new(Bytes::from_static(b"x"), [user]))
            .await
            .unwrap();
        assert_eq!(report, FanOutReport { delivered: 0, evicted: 1 });
        assert!(!hub.contains(id).await.unwrap());
        assert_eq!(hub.stats().evicted, 1);

        // Buffered payloads drain, then the queue reports closed.
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_session_does_not_block_others() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let slow_user = Uuid::new_v4();
        let fast_user = Uuid::new_v4();

        let (slow, _slow_queue) = attach(&hub, slow_user, 1).await;
        let (fast, mut fast_queue) = attach(&hub, fast_user, 8).await;

        hub.broadcast_with_report(FanOutRequest::new(Bytes::from_static(b"fill"), [slow_user]))
            .await
            .unwrap();

        let report = hub
            .broadcast_with_report(FanOutRequest::new(
                Bytes::from_static(b"both"),
                [slow_user, fast_user],
            ))
            .await
            .unwrap();
        assert_eq!(report, FanOutReport { delivered: 1, evicted: 1 });

        assert_eq!(fast_queue.try_recv().unwrap(), Bytes::from_static(b"both"));
        assert!(hub.contains(fast).await.unwrap());
        assert!(!hub.contains(slow).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_queue_is_dropped_on_broadcast() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let user = Uuid::new_v4();
        let (id, queue) = attach(&hub, user, 4).await;
        drop(queue);

        let report = hub
            .broadcast_with_report(FanOutRequest::new(Bytes::from_static(b"x"), [user]))
            .await
            .unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!hub.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_queue() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let (_, mut q1) = attach(&hub, Uuid::new_v4(), 4).await;
        let (_, mut q2) = attach(&hub, Uuid::new_v4(), 4).await;

        assert_eq!(hub.shutdown().await.unwrap(), 2);
        task.await.unwrap();

        assert!(q1.recv().await.is_none());
        assert!(q2.recv().await.is_none());
        assert!(hub.is_closed());
        assert!(matches!(
            hub.broadcast(FanOutRequest::new(Bytes::new(), Vec::<UserId>::new())).await,
            Err(HubError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_hub_stops_when_handles_dropped() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        drop(hub);
        task.await.unwrap();
    }
}
