//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_dispatch_total` (counter): AI dispatch attempts by endpoint, outcome
//! - `gateway_dispatch_duration_seconds` (histogram): per-attempt latency
//! - `gateway_breaker_state` (gauge): 0=closed, 1=half_open, 2=open, 3=permanently_open
//! - `gateway_capability_available` (gauge): cached capability per endpoint
//! - `gateway_pool_in_use` / `gateway_pool_idle` (gauge): per pool
//! - `gateway_pool_exhausted_total` / `gateway_pool_leaked_total` (counter)
//! - `gateway_storage_ops_total` (counter): by tier, op, outcome
//! - `gateway_storage_healthy` (gauge): 1=healthy, 0=unhealthy per tier
//!
//! # Design Decisions
//! - Updates go through the `metrics` facade; without an installed recorder
//!   they are no-ops, so library users and tests pay nothing
//! - The Prometheus exporter is installed only by the binary

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::time::Instant;

use crate::pool::PoolStats;
use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_dispatch(endpoint: &str, outcome: &'static str, started: Instant) {
    counter!("gateway_dispatch_total", "endpoint" => endpoint.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("gateway_dispatch_duration_seconds", "endpoint" => endpoint.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_no_backend() {
    counter!("gateway_no_available_backend_total").increment(1);
}

pub fn record_breaker_state(endpoint: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
        CircuitState::PermanentlyOpen => 3.0,
    };
    gauge!("gateway_breaker_state", "endpoint" => endpoint.to_string()).set(value);
}

pub fn record_capability(endpoint: &str, available: bool) {
    gauge!("gateway_capability_available", "endpoint" => endpoint.to_string())
        .set(if available { 1.0 } else { 0.0 });
}

pub fn record_pool_exhausted(pool: &str) {
    counter!("gateway_pool_exhausted_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_connection_leaks(pool: &str, count: u64) {
    counter!("gateway_pool_leaked_total", "pool" => pool.to_string()).increment(count);
}

pub fn record_pool_stats(stats: &PoolStats) {
    gauge!("gateway_pool_in_use", "pool" => stats.pool.clone()).set(stats.in_use as f64);
    gauge!("gateway_pool_idle", "pool" => stats.pool.clone()).set(stats.idle as f64);
}

pub fn record_storage_op(tier: &'static str, op: &'static str, outcome: &'static str) {
    counter!("gateway_storage_ops_total", "tier" => tier, "op" => op, "outcome" => outcome)
        .increment(1);
}

pub fn record_storage_health(tier: &'static str, healthy: bool) {
    gauge!("gateway_storage_healthy", "tier" => tier).set(if healthy { 1.0 } else { 0.0 });
}
