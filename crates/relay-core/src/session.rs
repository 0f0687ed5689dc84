//! Client sessions.
//!
//! A session binds one authenticated connection to the hub. It runs two
//! tasks over the split connection:
//!
//! - the **reader** enforces the read deadline and frame size limit and
//!   discards application payloads (the relay is push-only)
//! - the **writer** drains the outbound queue, sends pings and applies the
//!   write deadline
//!
//! The tasks share a [`SessionState`] watch that only moves forward. Whichever
//! task ends first advances it, which tells the other task to stop.

use bytes::Bytes;
use relay_protocol::UserId;
use relay_transport::{Connection, Frame, FrameSink, FrameStream};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::hub::{next_session_id, HubError, HubHandle, Registration, SessionId};
use crate::telemetry;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session config: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Per-session timing and sizing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity; a full queue gets the session evicted.
    pub queue_capacity: usize,
    /// Time allowed to write one frame.
    pub write_wait: Duration,
    /// Time allowed between liveness frames from the peer.
    pub pong_wait: Duration,
    /// Interval between pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Send payloads as binary frames instead of text frames.
    pub binary: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_message_size: 1024,
            binary: false,
        }
    }
}

impl SessionConfig {
    /// Check the invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.queue_capacity == 0 {
            return Err(SessionError::InvalidConfig("queue capacity must be non-zero"));
        }
        if self.ping_period.is_zero() || self.write_wait.is_zero() {
            return Err(SessionError::InvalidConfig("timeouts must be non-zero"));
        }
        if self.ping_period >= self.pong_wait {
            return Err(SessionError::InvalidConfig(
                "ping period must be shorter than pong wait",
            ));
        }
        Ok(())
    }
}

/// Session lifecycle. Declaration order is the only allowed direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Connecting,
    Registered,
    Draining,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether the session has started shutting down.
    #[must_use]
    pub fn is_terminating(self) -> bool {
        self >= SessionState::Draining
    }
}

/// Why a session task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or hung up.
    PeerClosed,
    /// The transport reported a read error.
    ReadFailed,
    /// No liveness frame arrived within the read deadline.
    ReadTimeout,
    /// The peer sent a frame over the size limit.
    MessageTooLarge,
    /// The transport reported a write error.
    WriteFailed,
    /// A write did not complete within the write deadline.
    WriteTimeout,
    /// The hub closed the outbound queue.
    QueueClosed,
    /// The other task ended the session first.
    Cancelled,
}

impl CloseReason {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadFailed => "read_failed",
            CloseReason::ReadTimeout => "read_timeout",
            CloseReason::MessageTooLarge => "message_too_large",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::QueueClosed => "queue_closed",
            CloseReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How each task of a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub reader: CloseReason,
    pub writer: CloseReason,
}

/// Forward-only lifecycle shared by the two tasks.
struct Lifecycle {
    state: watch::Sender<SessionState>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(SessionState::Connecting),
        }
    }

    /// Move to `next` if it is ahead of the current state.
    fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

/// Resolve once the session is terminating or the lifecycle is gone.
async fn terminating(state: &mut watch::Receiver<SessionState>) {
    loop {
        let done = state.borrow_and_update().is_terminating();
        if done || state.changed().await.is_err() {
            return;
        }
    }
}

struct Context {
    id: SessionId,
    user_id: UserId,
    hub: HubHandle,
    lifecycle: Lifecycle,
    config: SessionConfig,
}

/// Handle to a running session.
pub struct SessionHandle {
    id: SessionId,
    user_id: UserId,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait for both tasks to finish.
    pub async fn closed(self) -> SessionOutcome {
        self.task.await.unwrap_or(SessionOutcome {
            reader: CloseReason::Cancelled,
            writer: CloseReason::Cancelled,
        })
    }
}

/// Register a connection with the hub and start its reader and writer.
///
/// The connection is dropped without a close handshake if registration fails.
///
/// # Errors
///
/// Returns an error if the config is invalid or the hub has stopped.
pub async fn connect(
    hub: &HubHandle,
    connection: Box<dyn Connection>,
    user_id: UserId,
    config: SessionConfig,
) -> Result<SessionHandle, SessionError> {
    config.validate()?;

    let id = next_session_id();
    let remote = connection.remote_addr();
    let (outbound, queue) = mpsc::channel(config.queue_capacity);

    let context = Arc::new(Context {
        id,
        user_id,
        hub: hub.clone(),
        lifecycle: Lifecycle::new(),
        config,
    });

    hub.register(Registration {
        id,
        user_id,
        outbound,
    })
    .await?;
    context.lifecycle.advance(SessionState::Registered);
    telemetry::record_session_opened();

    info!(session = id, user = %user_id, remote = ?remote, "Session opened");

    let (sink, stream) = connection.split();
    let state = context.lifecycle.subscribe();

    let reader = tokio::spawn(read_pump(context.clone(), stream));
    let writer = tokio::spawn(write_pump(context.clone(), sink, queue));

    let task = tokio::spawn(async move {
        let (reader, writer) = tokio::join!(reader, writer);
        let outcome = SessionOutcome {
            reader: reader.unwrap_or(CloseReason::Cancelled),
            writer: writer.unwrap_or(CloseReason::Cancelled),
        };
        context.lifecycle.advance(SessionState::Closed);
        telemetry::record_session_closed(primary_reason(outcome).as_str());

        info!(
            session = context.id,
            user = %context.user_id,
            reader = %outcome.reader,
            writer = %outcome.writer,
            "Session closed"
        );
        outcome
    });

    Ok(SessionHandle {
        id,
        user_id,
        state,
        task,
    })
}

/// The reason that actually ended the session.
fn primary_reason(outcome: SessionOutcome) -> CloseReason {
    if outcome.reader == CloseReason::Cancelled {
        outcome.writer
    } else {
        outcome.reader
    }
}

async fn read_pump(context: Arc<Context>, mut stream: Box<dyn FrameStream>) -> CloseReason {
    let id = context.id;
    let pong_wait = context.config.pong_wait;
    let max_message_size = context.config.max_message_size;
    let mut state = context.lifecycle.subscribe();
    let mut deadline = Instant::now() + pong_wait;

    let reason = loop {
        tokio::select! {
            result = tokio::time::timeout_at(deadline, stream.recv()) => match result {
                Err(_) => break CloseReason::ReadTimeout,
                Ok(Err(e)) => {
                    debug!(session = id, error = %e, "Read failed");
                    break CloseReason::ReadFailed;
                }
                Ok(Ok(None | Some(Frame::Close))) => break CloseReason::PeerClosed,
                Ok(Ok(Some(frame))) => {
                    if frame.len() > max_message_size {
                        warn!(session = id, size = frame.len(), limit = max_message_size, "Inbound frame too large");
                        break CloseReason::MessageTooLarge;
                    }
                    if frame.is_liveness() {
                        deadline = Instant::now() + pong_wait;
                        trace!(session = id, "Read deadline extended");
                    }
                }
            },
            () = terminating(&mut state) => break CloseReason::Cancelled,
        }
    };

    if reason != CloseReason::Cancelled {
        context.lifecycle.advance(SessionState::Closing);
        debug!(session = id, reason = %reason, "Reader stopped");
    }

    // Idempotent: harmless if the writer or the hub already removed us.
    let _ = context.hub.unregister(id).await;
    reason
}

async fn write_pump(
    context: Arc<Context>,
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::Receiver<Bytes>,
) -> CloseReason {
    let id = context.id;
    let write_wait = context.config.write_wait;
    let ping_period = context.config.ping_period;
    let mut state = context.lifecycle.subscribe();

    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            item = queue.recv() => match item {
                Some(payload) => {
                    let frame = if context.config.binary {
                        Frame::Binary(payload)
                    } else {
                        Frame::Text(payload)
                    };
                    if let Err(reason) = send_with_deadline(sink.as_mut(), frame, write_wait).await {
                        break reason;
                    }
                }
                None => {
                    // Buffered payloads are already written; say goodbye.
                    if context.lifecycle.advance(SessionState::Draining) {
                        debug!(session = id, "Outbound queue closed, sending close frame");
                        let _ = send_with_deadline(sink.as_mut(), Frame::Close, write_wait).await;
                    }
                    break CloseReason::QueueClosed;
                }
            },
            _ = ticker.tick() => {
                trace!(session = id, "Sending ping");
                if let Err(reason) = send_with_deadline(sink.as_mut(), Frame::Ping(Bytes::new()), write_wait).await {
                    break reason;
                }
            }
            () = terminating(&mut state) => break CloseReason::Cancelled,
        }
    };

    if matches!(reason, CloseReason::WriteFailed | CloseReason::WriteTimeout) {
        context.lifecycle.advance(SessionState::Closing);
        debug!(session = id, reason = %reason, state = ?context.lifecycle.current(), "Writer stopped");
        let _ = context.hub.unregister(id).await;
    }

    if timeout(write_wait, sink.close()).await.is_err() {
        debug!(session = id, "Transport close timed out");
    }
    reason
}

async fn send_with_deadline(
    sink: &mut dyn FrameSink,
    frame: Frame,
    write_wait: Duration,
) -> Result<(), CloseReason> {
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "Write failed");
            Err(CloseReason::WriteFailed)
        }
        Err(_) => Err(CloseReason::WriteTimeout),
    }
}
