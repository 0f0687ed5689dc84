//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (`RELAY__SECTION__KEY`, plus `RELAY_HOST` and
//!   `RELAY_PORT` for the listener)
//! - Command line arguments (see `main.rs`)

use anyhow::{bail, Context, Result};
use relay_core::SessionConfig;
use relay_protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Crawler configuration.
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Auth service configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Message store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Payload encoding pushed to clients.
    #[serde(default)]
    pub encoding: Encoding,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Outbound queue capacity per session.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time allowed to write a frame, in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Time allowed between pongs, in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Ping interval in milliseconds. Must be below `pong_wait_ms`.
    #[serde(default = "default_ping_period")]
    pub ping_period_ms: u64,
}

/// Crawler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_crawl_interval")]
    pub interval_ms: u64,

    /// Checkpoint skew margin in milliseconds.
    #[serde(default)]
    pub skew_margin_ms: u64,
}

/// Auth service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the auth service.
    #[serde(default = "default_auth_url")]
    pub service_url: String,

    /// Cookie carrying the session token.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_auth_timeout")]
    pub timeout_ms: u64,
}

/// Message store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// MongoDB connection string.
    #[serde(default = "default_mongo_uri")]
    pub mongo_uri: String,

    /// Database holding the `messages` and `chats` collections.
    #[serde(default = "default_database")]
    pub database: String,

    /// Server selection timeout in milliseconds, unless the URI sets one.
    #[serde(default = "default_store_timeout")]
    pub connect_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4242)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    1024
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_ping_period() -> u64 {
    // 9/10 of the pong wait
    54_000
}

fn default_crawl_interval() -> u64 {
    1_000
}

fn default_auth_url() -> String {
    "http://localhost:4244".to_string()
}

fn default_cookie_name() -> String {
    "commz-token".to_string()
}

fn default_auth_timeout() -> u64 {
    5_000
}

fn default_mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "commz".to_string()
}

fn default_store_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            crawler: CrawlerConfig::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            encoding: Encoding::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            send_queue_capacity: default_send_queue_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: default_ping_period(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_crawl_interval(),
            skew_margin_ms: 0,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_url: default_auth_url(),
            cookie_name: default_cookie_name(),
            timeout_ms: default_auth_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mongo_uri: default_mongo_uri(),
            database: default_database(),
            connect_timeout_ms: default_store_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Uses `explicit` if given, otherwise the first existing default path.
    /// Environment variables are layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be parsed or the result is
    /// invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_default_file(),
        };

        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().with_context(|| match &path {
            Some(path) => format!("Failed to load config file: {}", path.display()),
            None => "Failed to read environment configuration".to_string(),
        })?;
        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file, without environment layering.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_connections == 0 {
            bail!("limits.max_connections must be non-zero");
        }
        if self.crawler.interval_ms == 0 {
            bail!("crawler.interval_ms must be non-zero");
        }
        if self.store.mongo_uri.is_empty() {
            bail!("store.mongo_uri must be set");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        self.session_config()
            .validate()
            .context("Invalid heartbeat or limits configuration")?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Session settings derived from heartbeat, limits and transport.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.limits.send_queue_capacity,
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_period_ms),
            max_message_size: self.limits.max_message_size,
            binary: self.transport.encoding.is_binary(),
        }
    }

    #[must_use]
    pub fn crawler_config(&self) -> relay_core::CrawlerConfig {
        relay_core::CrawlerConfig {
            interval: Duration::from_millis(self.crawler.interval_ms),
            skew_margin: Duration::from_millis(self.crawler.skew_margin_ms),
            encoding: self.transport.encoding,
        }
    }
}
