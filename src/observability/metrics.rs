//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_client_connections_total` (counter): accepted client sessions
//! - `proxy_messages_relayed_total` (counter): relayed messages by direction
//! - `proxy_upstream_gone_total` (counter): ungraceful upstream losses
//! - `proxy_upstream_promotions_total` (counter): health-checked promotions
//! - `proxy_active_sessions` (gauge): current session count
//! - `proxy_backend_health` (gauge): 1=healthy, 0=unhealthy, by endpoint

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const CLIENT_CONNECTIONS_TOTAL: &str = "proxy_client_connections_total";
pub const MESSAGES_RELAYED_TOTAL: &str = "proxy_messages_relayed_total";
pub const UPSTREAM_GONE_TOTAL: &str = "proxy_upstream_gone_total";
pub const UPSTREAM_PROMOTIONS_TOTAL: &str = "proxy_upstream_promotions_total";
pub const ACTIVE_SESSIONS: &str = "proxy_active_sessions";
pub const BACKEND_HEALTH: &str = "proxy_backend_health";

/// Direction label for relayed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_client_connection() {
    metrics::counter!(CLIENT_CONNECTIONS_TOTAL).increment(1);
}

pub fn record_relayed(direction: Direction) {
    metrics::counter!(MESSAGES_RELAYED_TOTAL, "direction" => direction.as_str()).increment(1);
}

pub fn record_upstream_gone() {
    metrics::counter!(UPSTREAM_GONE_TOTAL).increment(1);
}

pub fn record_promotion() {
    metrics::counter!(UPSTREAM_PROMOTIONS_TOTAL).increment(1);
}

pub fn record_active_sessions(count: usize) {
    metrics::gauge!(ACTIVE_SESSIONS).set(count as f64);
}

pub fn record_backend_health(endpoint: &str, healthy: bool) {
    metrics::gauge!(BACKEND_HEALTH, "endpoint" => endpoint.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}
