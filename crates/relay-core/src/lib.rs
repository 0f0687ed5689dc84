//! # relay-core
//!
//! Connection hub, client sessions and change-feed crawler for the Commz
//! realtime relay.
//!
//! - **Hub** - single task owning the live session set and fanning payloads
//!   out to users
//! - **Session** - reader and writer tasks for one authenticated connection
//! - **Crawler** - polls the message store and feeds the hub
//! - **Store** - the two queries the crawler needs
//! - **Auth** - credential to user resolution
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  FanOutRequest  ┌─────────────┐  outbound queue  ┌─────────────┐
//! │   Crawler   │────────────────▶│     Hub     │─────────────────▶│   Session   │
//! └─────────────┘                 └─────────────┘                  └─────────────┘
//!        │                               ▲                                │
//!        ▼                               └──── register / unregister ─────┘
//! ┌─────────────┐
//! │ MessageStore│
//! └─────────────┘
//! ```

pub mod auth;
pub mod crawler;
pub mod hub;
pub mod session;
pub mod store;
pub mod telemetry;

pub use auth::{AuthError, Authenticator, StaticAuthenticator};
pub use crawler::{CrawlError, Crawler, CrawlerConfig, CycleReport};
pub use hub::{
    FanOutReport, FanOutRequest, Hub, HubConfig, HubError, HubHandle, HubStats, Registration,
    SessionId,
};
pub use session::{
    connect, CloseReason, SessionConfig, SessionError, SessionHandle, SessionOutcome,
    SessionState,
};
pub use store::{MemoryStore, MessageStore, StoreError};
