//! HTTP surface and process wiring.
//!
//! Routes:
//! - `GET /ws` (configurable) - authenticated WebSocket upgrade
//! - `GET /health` - JSON liveness report
//! - `GET /version` - plain-text version

use crate::auth::HttpAuthenticator;
use crate::config::Config;
use crate::store::MongoStore;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use relay_core::{
    session, telemetry, AuthError, Authenticator, Crawler, Hub, HubConfig, HubHandle,
    MessageStore, SessionConfig,
};
use relay_transport::AxumConnection;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the connection hub.
    pub hub: HubHandle,
    /// Verifies upgrade credentials.
    pub authenticator: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
    session_config: SessionConfig,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            session_config: config.session_config(),
            hub,
            authenticator,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .with_state(state)
}

/// Run the relay against MongoDB and the HTTP auth service.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = crate::metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let authenticator =
        HttpAuthenticator::new(&config.auth).context("Failed to build auth service client")?;

    let store = MongoStore::connect(&config.store)
        .await
        .context("Failed to connect to MongoDB")?;

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    serve(
        listener,
        config,
        Arc::new(store),
        Arc::new(authenticator),
        shutdown_signal(),
    )
    .await
}

/// Serve on `listener` until `shutdown` resolves, then stop the crawler and
/// close every session.
///
/// # Errors
///
/// Returns an error if the HTTP server fails.
pub async fn serve<F>(
    listener: TcpListener,
    config: Config,
    store: Arc<dyn MessageStore>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (hub, hub_task) = Hub::spawn(HubConfig::default());

    let (stop_crawler, crawler_signal) = watch::channel(false);
    let crawler = Crawler::new(store, hub.clone(), config.crawler_config());
    let crawler_task = tokio::spawn(crawler.run(crawler_signal));

    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(config, hub.clone(), authenticator));
    let app = router(state);

    // Upgraded sockets outlive the HTTP connections axum drains, so the hub
    // closes them once the signal fires.
    let drain = async move {
        shutdown.await;
        info!("Draining relay");

        let _ = stop_crawler.send(true);
        if let Err(e) = crawler_task.await {
            warn!(error = %e, "Crawler task failed");
        }

        match hub.shutdown().await {
            Ok(closed) => info!(sessions = closed, "Hub shut down"),
            Err(_) => debug!("Hub already stopped"),
        }
    };

    let addr = listener.local_addr()?;
    info!("Relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(drain)
    .await?;

    let _ = hub_task.await;
    info!("Relay stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.hub.stats().sessions,
    }))
}

async fn version_handler() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// WebSocket upgrade handler.
///
/// Admission happens before the upgrade: a refused client gets a plain HTTP
/// status and never reaches the hub.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if state.hub.stats().sessions >= state.config.limits.max_connections {
        warn!(remote = %remote, "Connection limit reached");
        telemetry::record_connection_rejected("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let token = cookie_value(&headers, &state.config.auth.cookie_name).unwrap_or_default();
    let user_id = match state.authenticator.verify(token).await {
        Ok(user_id) => user_id,
        Err(e) => return reject(remote, &e),
    };

    let ws = ws.max_message_size(state.config.limits.max_message_size);
    ws.on_upgrade(move |socket| async move {
        let connection = AxumConnection::new(socket).with_remote_addr(remote);
        if let Err(e) = session::connect(
            &state.hub,
            Box::new(connection),
            user_id,
            state.session_config.clone(),
        )
        .await
        {
            error!(user = %user_id, error = %e, "Failed to start session");
        }
    })
}

fn reject(remote: SocketAddr, e: &AuthError) -> Response {
    if e.is_client_error() {
        debug!(remote = %remote, error = %e, "Upgrade refused");
        telemetry::record_auth_failure("rejected");
        (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    } else {
        warn!(remote = %remote, error = %e, "Auth service unavailable");
        telemetry::record_auth_failure("unavailable");
        (StatusCode::SERVICE_UNAVAILABLE, "auth service unavailable").into_response()
    }
}

/// Find a cookie by name across all `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
        .filter(|value| !value.is_empty())
}
