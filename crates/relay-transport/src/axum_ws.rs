//! axum WebSocket adapter.
//!
//! Wraps a socket produced by `WebSocketUpgrade::on_upgrade` so it can be
//! handed to a session.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::debug;

use crate::traits::{Connection, Frame, FrameSink, FrameStream, TransportError};

/// An upgraded axum WebSocket.
pub struct AxumConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            remote_addr: None,
        }
    }

    /// Attach the peer address reported by the HTTP layer.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Connection for AxumConnection {
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.socket.split();
        (Box::new(AxumSink { sink }), Box::new(AxumFrames { stream }))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(data) => Message::Text(
                String::from_utf8(data.to_vec()).map_err(|_| TransportError::InvalidUtf8)?,
            ),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
            Frame::Ping(data) => Message::Ping(data.to_vec()),
            Frame::Pong(data) => Message::Pong(data.to_vec()),
            Frame::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // axum reports an error when the peer already completed the handshake
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close after peer hangup");
        }
        Ok(())
    }
}

struct AxumFrames {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for AxumFrames {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(Some(match message {
                Message::Text(text) => Frame::Text(Bytes::from(text)),
                Message::Binary(data) => Frame::Binary(Bytes::from(data)),
                Message::Ping(data) => Frame::Ping(Bytes::from(data)),
                Message::Pong(data) => Frame::Pong(Bytes::from(data)),
                Message::Close(_) => Frame::Close,
            })),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }
}
