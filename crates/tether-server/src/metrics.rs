//! Metrics collection and export for Tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tether_core::FanOut;
use tether_protocol::EventKind;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
    pub const EVENTS_TOTAL: &str = "tether_events_total";
    pub const EVENTS_BYTES: &str = "tether_events_bytes";
    pub const FANOUT_DELIVERED: &str = "tether_fanout_delivered_total";
    pub const FANOUT_DROPPED: &str = "tether_fanout_dropped_total";
    pub const GROUPS_ACTIVE: &str = "tether_groups_active";
    pub const GROUPS_CREATED: &str = "tether_groups_created_total";
    pub const GROUPS_EVICTED: &str = "tether_groups_evicted_total";
    pub const MEMBERS_JOINED: &str = "tether_members_joined_total";
    pub const LATENCY_SECONDS: &str = "tether_event_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Direction of an event relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
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
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events by kind");
    metrics::describe_counter!(names::EVENTS_BYTES, "Total encoded bytes of events");
    metrics::describe_counter!(
        names::FANOUT_DELIVERED,
        "Events queued on another connection's outbox"
    );
    metrics::describe_counter!(
        names::FANOUT_DROPPED,
        "Events dropped because a recipient's outbox was full or closed"
    );
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of active groups");
    metrics::describe_counter!(names::GROUPS_CREATED, "Total number of groups created");
    metrics::describe_counter!(names::GROUPS_EVICTED, "Total number of groups evicted by age");
    metrics::describe_counter!(names::MEMBERS_JOINED, "Total number of members added to groups");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event crossing the socket.
pub fn record_event(kind: EventKind, bytes: usize, direction: Direction) {
    counter!(
        names::EVENTS_TOTAL,
        "kind" => kind.as_str(),
        "direction" => direction.as_str()
    )
    .increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction.as_str()).increment(bytes as u64);
}

/// Record the fan-out of one relayed event.
pub fn record_fan_out(fan_out: FanOut) {
    counter!(names::FANOUT_DELIVERED).increment(fan_out.delivered as u64);
    if fan_out.dropped > 0 {
        counter!(names::FANOUT_DROPPED).increment(fan_out.dropped as u64);
    }
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record a group creation.
pub fn record_group_created() {
    counter!(names::GROUPS_CREATED).increment(1);
    counter!(names::MEMBERS_JOINED).increment(1);
}

/// Record a member joining an existing group.
pub fn record_member_joined() {
    counter!(names::MEMBERS_JOINED).increment(1);
}

/// Record groups removed by the sweeper.
pub fn record_groups_evicted(count: usize) {
    counter!(names::GROUPS_EVICTED).increment(count as u64);
}

/// Update active group count.
pub fn set_active_groups(count: usize) {
    gauge!(names::GROUPS_ACTIVE).set(count as f64);
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
