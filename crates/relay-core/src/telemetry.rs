//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed (the server installs a Prometheus exporter).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "relay_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const SESSIONS_CLOSED: &str = "relay_sessions_closed_total";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";
    pub const CRAWL_CYCLES_TOTAL: &str = "relay_crawl_cycles_total";
    pub const CRAWL_ERRORS_TOTAL: &str = "relay_crawl_errors_total";
    pub const CRAWL_DURATION_SECONDS: &str = "relay_crawl_duration_seconds";
    pub const MESSAGES_RELAYED: &str = "relay_messages_relayed_total";
    pub const AUTH_FAILURES_TOTAL: &str = "relay_auth_failures_total";
    pub const CONNECTIONS_REJECTED: &str = "relay_connections_rejected_total";
}

pub fn record_session_opened() {
    counter!(names::SESSIONS_TOTAL).increment(1);
}

/// Record a finished session and the reason it ended.
pub fn record_session_closed(reason: &'static str) {
    counter!(names::SESSIONS_CLOSED, "reason" => reason).increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(count as f64);
}

/// Record the outcome of one fan-out.
pub fn record_fan_out(delivered: usize, evicted: usize) {
    if delivered > 0 {
        counter!(names::DELIVERIES_TOTAL).increment(delivered as u64);
    }
    if evicted > 0 {
        counter!(names::EVICTIONS_TOTAL).increment(evicted as u64);
    }
}

/// Record a successful crawl cycle.
pub fn record_crawl_cycle(elapsed: Duration, relayed: usize) {
    counter!(names::CRAWL_CYCLES_TOTAL).increment(1);
    histogram!(names::CRAWL_DURATION_SECONDS).record(elapsed.as_secs_f64());
    counter!(names::MESSAGES_RELAYED).increment(relayed as u64);
}

pub fn record_crawl_error(kind: &'static str) {
    counter!(names::CRAWL_ERRORS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_auth_failure(kind: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "kind" => kind).increment(1);
}

/// Record a connection refused before a session was created.
pub fn record_connection_rejected(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}
