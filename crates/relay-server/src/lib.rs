//! # relay-server
//!
//! HTTP gateway for the Commz realtime relay: authenticates WebSocket
//! upgrades, reads the chat database, runs the hub and the crawler, and
//! exports metrics.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod store;

pub use auth::HttpAuthenticator;
pub use config::Config;
pub use store::MongoStore;
pub use handlers::{router, run_server, serve, shutdown_signal, AppState};
