//! # relay-transport
//!
//! Transport abstraction layer for the Commz relay.
//!
//! Sessions talk to clients through a framed duplex channel rather than a
//! concrete socket type:
//!
//! - **axum** - WebSockets upgraded by the HTTP gateway
//! - **WebSocket** - raw tokio-tungstenite streams
//! - **memory** - in-process pairs for tests and tooling
//!
//! ## Transport Abstraction
//!
//! Every transport implements [`Connection`], which splits into a
//! [`FrameSink`] and a [`FrameStream`] so reads and writes can run in
//! separate tasks.
//!
//! ```rust,ignore
//! use relay_transport::{Connection, Frame};
//!
//! async fn pump(conn: Box<dyn Connection>) {
//!     let (mut sink, mut stream) = conn.split();
//!     while let Ok(Some(frame)) = stream.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "axum")]
pub mod axum_ws;

pub use traits::{Connection, Frame, FrameSink, FrameStream, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

#[cfg(feature = "axum")]
pub use axum_ws::AxumConnection;
