//! In-memory duplex transport.
//!
//! [`pair`] returns a server-side [`MemoryConnection`] and the [`MemoryPeer`]
//! that plays the client. Each direction is a bounded channel: a peer that
//! stops reading eventually blocks the server's writes, which is how slow
//! consumers are simulated.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{Connection, Frame, FrameSink, FrameStream, TransportError};

/// Create a connected pair with `capacity` frames of buffering per direction.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_peer, from_server) = mpsc::channel(capacity);
    let (to_server, from_peer) = mpsc::channel(capacity);

    (
        MemoryConnection { to_peer, from_peer },
        MemoryPeer {
            tx: to_server,
            rx: from_server,
        },
    )
}

/// Server side of an in-memory pair.
pub struct MemoryConnection {
    to_peer: mpsc::Sender<Frame>,
    from_peer: mpsc::Receiver<Frame>,
}

impl Connection for MemoryConnection {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(MemorySink {
                tx: Some(self.to_peer),
            }),
            Box::new(MemoryFrames { rx: self.from_peer }),
        )
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryFrames {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameStream for MemoryFrames {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Client side of an in-memory pair.
pub struct MemoryPeer {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryPeer {
    /// Send a frame to the server side.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has been dropped.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the server's write half is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive a frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Stop reading from the server; further server writes fail.
    pub fn close_read(&mut self) {
        self.rx.close();
    }
}
