//! Metrics export for the relay.
//!
//! Instrumentation lives in `relay_core::telemetry`; this module describes
//! the metrics and exports them in Prometheus format.

use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::telemetry::names;
use std::net::SocketAddr;
use tracing::info;

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_counter!(
        names::SESSIONS_CLOSED,
        "Sessions closed, labelled by reason"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Payloads handed to session send queues"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Sessions evicted because their send queue was full"
    );
    metrics::describe_counter!(names::CRAWL_CYCLES_TOTAL, "Completed crawler cycles");
    metrics::describe_counter!(names::CRAWL_ERRORS_TOTAL, "Failed crawler cycles");
    metrics::describe_histogram!(
        names::CRAWL_DURATION_SECONDS,
        "Crawler cycle duration in seconds"
    );
    metrics::describe_counter!(
        names::MESSAGES_RELAYED,
        "Messages submitted to the hub by the crawler"
    );
    metrics::describe_counter!(names::AUTH_FAILURES_TOTAL, "Failed credential checks");
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrade requests refused before a session was created"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}
