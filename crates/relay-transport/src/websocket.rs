//! WebSocket transport implementation.
//!
//! This module adapts tokio-tungstenite streams to the [`Connection`] trait.
//! It is used for standalone listeners and by clients in tests; the HTTP
//! server uses the axum adapter instead.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, trace};

use crate::traits::{Connection, Frame, FrameSink, FrameStream, TransportError};

/// A WebSocket connection over any async byte stream.
pub struct WebSocketConnection<S> {
    stream: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
}

impl<S> WebSocketConnection<S> {
    /// Wrap an already-upgraded WebSocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            remote_addr: None,
        }
    }
}

impl WebSocketConnection<TcpStream> {
    /// Run the server side of the WebSocket handshake on a TCP stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn accept(stream: TcpStream) -> Result<Self, TransportError> {
        let addr = stream.peer_addr().map_err(TransportError::Io)?;

        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| TransportError::ReceiveFailed(format!("WebSocket handshake failed: {}", e)))?;

        debug!("WebSocket handshake completed with {}", addr);

        Ok(Self {
            stream: ws_stream,
            remote_addr: Some(addr),
        })
    }
}

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketFrames { stream }),
        )
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = into_message(frame)?;
        self.sink
            .send(message)
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                other => TransportError::SendFailed(other.to_string()),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {}", e))),
        }
    }
}

/// Read half of a [`WebSocketConnection`].
pub struct WebSocketFrames<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WebSocketFrames<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(message)) => {
                    if let Some(frame) = from_message(message) {
                        return Ok(Some(frame));
                    }
                    // Raw frame, ignore
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

fn into_message(frame: Frame) -> Result<Message, TransportError> {
    Ok(match frame {
        Frame::Text(data) => Message::Text(
            String::from_utf8(data.to_vec()).map_err(|_| TransportError::InvalidUtf8)?,
        ),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
        Frame::Ping(data) => Message::Ping(data.to_vec()),
        Frame::Pong(data) => Message::Pong(data.to_vec()),
        Frame::Close => Message::Close(None),
    })
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(Bytes::from(text))),
        Message::Binary(data) => Some(Frame::Binary(Bytes::from(data))),
        Message::Ping(data) => Some(Frame::Ping(Bytes::from(data))),
        Message::Pong(data) => Some(Frame::Pong(Bytes::from(data))),
        Message::Close(reason) => {
            trace!(?reason, "Received close frame");
            Some(Frame::Close)
        }
        Message::Frame(_) => None,
    }
}
