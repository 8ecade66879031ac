//! Metrics collection and exposition.
//!
//! # Metrics
//! - `router_connections_accepted_total` (counter): connections that entered Pending
//! - `router_pending_connections` (gauge): live size of the routing registry, moved by
//!   one at each insert and remove so concurrent updates cannot overwrite each other
//! - `router_routed_total` (counter): handoffs by route name
//! - `router_teardowns_total` (counter): teardowns by error kind
//! - `router_routing_duration_seconds` (histogram): accept to handoff
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus exporter with its own HTTP listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_accepted() {
    counter!("router_connections_accepted_total").increment(1);
}

/// Called once per successful registry insert.
pub fn record_pending_added() {
    gauge!("router_pending_connections").increment(1.0);
}

/// Called once per successful registry remove.
pub fn record_pending_removed() {
    gauge!("router_pending_connections").decrement(1.0);
}

pub fn record_routed(route: &str, accepted_at: Instant) {
    counter!("router_routed_total", "route" => route.to_string()).increment(1);
    histogram!("router_routing_duration_seconds").record(accepted_at.elapsed().as_secs_f64());
}

pub fn record_teardown(reason: &'static str) {
    counter!("router_teardowns_total", "reason" => reason).increment(1);
}
