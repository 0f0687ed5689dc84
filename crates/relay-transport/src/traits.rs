//! Transport abstraction traits for the relay.
//!
//! A [`Connection`] is a framed duplex channel. Sessions split it into a
//! [`FrameSink`] owned by the writer task and a [`FrameStream`] owned by the
//! reader task, so a slow write never blocks a read and vice versa.
//! Deadlines are applied by the caller around each `send`/`recv`.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// A single frame on a message-framed duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 application payload.
    Text(Bytes),
    /// Binary application payload.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness reply.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl Frame {
    /// Whether this frame is a liveness control frame.
    #[must_use]
    pub fn is_liveness(&self) -> bool {
        matches!(self, Frame::Ping(_) | Frame::Pong(_))
    }

    /// Size of the frame's payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(data) | Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => {
                data.len()
            }
            Frame::Close => 0,
        }
    }

    /// Whether the frame carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Text(data) => write!(f, "text({} bytes)", data.len()),
            Frame::Binary(data) => write!(f, "binary({} bytes)", data.len()),
            Frame::Ping(_) => write!(f, "ping"),
            Frame::Pong(_) => write!(f, "pong"),
            Frame::Close => write!(f, "close"),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Text frame payload was not valid UTF-8.
    #[error("Text frame is not valid UTF-8")]
    InvalidUtf8,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the peer.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Flush and close the write half.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has gone away cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// An established connection that can be split into independent halves.
pub trait Connection: Send + 'static {
    /// Split into a write half and a read half.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
