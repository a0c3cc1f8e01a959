//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use herald_core::Gateway;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const USERS_ACTIVE: &str = "herald_users_active";
    pub const HANDSHAKE_REJECTIONS_TOTAL: &str = "herald_handshake_rejections_total";
    pub const EVENTS_TOTAL: &str = "herald_events_total";
    pub const EVENTS_BYTES: &str = "herald_events_bytes";
    pub const EVENT_LATENCY_SECONDS: &str = "herald_event_latency_seconds";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
    pub const BROADCAST_PUBLISHED_TOTAL: &str = "herald_broadcast_published_total";
    pub const BROADCAST_PUBLISH_FAILURES_TOTAL: &str = "herald_broadcast_publish_failures_total";
    pub const BROADCAST_RECEIVED_TOTAL: &str = "herald_broadcast_received_total";
    pub const BROADCAST_DELIVERED_TOTAL: &str = "herald_broadcast_delivered_total";
    pub const BROADCAST_DROPPED_TOTAL: &str = "herald_broadcast_dropped_total";
    pub const BROADCAST_PUBLISH_DROPPED_TOTAL: &str = "herald_broadcast_publish_dropped_total";
    pub const BROADCAST_CACHE_HITS_TOTAL: &str = "herald_broadcast_cache_hits_total";
    pub const BROADCAST_PENDING: &str = "herald_broadcast_pending";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(names::USERS_ACTIVE, "Distinct users connected to this process");
    metrics::describe_counter!(
        names::HANDSHAKE_REJECTIONS_TOTAL,
        "Connections refused before upgrade"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total bytes of events processed");
    metrics::describe_histogram!(
        names::EVENT_LATENCY_SECONDS,
        "Inbound event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(
        names::BROADCAST_PUBLISHED_TOTAL,
        "Frames published to the coordination store"
    );
    metrics::describe_counter!(
        names::BROADCAST_PUBLISH_FAILURES_TOTAL,
        "Frames that failed to publish"
    );
    metrics::describe_counter!(
        names::BROADCAST_RECEIVED_TOTAL,
        "Envelopes received from the coordination store"
    );
    metrics::describe_counter!(
        names::BROADCAST_DELIVERED_TOTAL,
        "Events queued to local sessions"
    );
    metrics::describe_counter!(
        names::BROADCAST_DROPPED_TOTAL,
        "Events dropped on full session queues"
    );
    metrics::describe_counter!(
        names::BROADCAST_PUBLISH_DROPPED_TOTAL,
        "Broadcast frames dropped on a full publisher queue"
    );
    metrics::describe_counter!(
        names::BROADCAST_CACHE_HITS_TOTAL,
        "Envelope encodings served from the codec cache"
    );
    metrics::describe_gauge!(names::BROADCAST_PENDING, "Envelopes waiting in batch queues");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Periodically export gateway and broadcast engine statistics.
pub fn spawn_reporter(gateway: Arc<Gateway>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => report(&gateway),
            }
        }
    });
}

fn report(gateway: &Gateway) {
    let stats = gateway.engine().stats();
    counter!(names::BROADCAST_PUBLISHED_TOTAL).absolute(stats.published);
    counter!(names::BROADCAST_PUBLISH_FAILURES_TOTAL).absolute(stats.publish_failures);
    counter!(names::BROADCAST_PUBLISH_DROPPED_TOTAL).absolute(stats.publish_dropped);
    counter!(names::BROADCAST_CACHE_HITS_TOTAL).absolute(stats.cache_hits);
    counter!(names::BROADCAST_RECEIVED_TOTAL).absolute(stats.received);
    counter!(names::BROADCAST_DELIVERED_TOTAL).absolute(stats.delivered);
    counter!(names::BROADCAST_DROPPED_TOTAL).absolute(stats.dropped);
    gauge!(names::BROADCAST_PENDING).set(stats.pending as f64);
    gauge!(names::USERS_ACTIVE).set(gateway.connected_users_count() as f64);
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused before upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::HANDSHAKE_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record an event.
pub fn record_event(bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound event latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::EVENT_LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
