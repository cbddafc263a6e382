//! Prometheus metrics (spec section 10.4). Navigator's metric names are
//! plain (no crate-name prefix) since the whole exporter belongs to one
//! process; only counters/gauges that have an independent consumer
//! (dashboards, alerts) are registered here.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "navigator_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "navigator_request_duration_seconds";

pub const TENANT_STARTS_TOTAL: &str = "navigator_tenant_starts_total";
pub const TENANT_START_FAILURES_TOTAL: &str = "navigator_tenant_start_failures_total";
pub const TENANT_INSTANCES_RUNNING: &str = "navigator_tenant_instances_running";
pub const TENANT_IDLE_SHUTDOWNS_TOTAL: &str = "navigator_tenant_idle_shutdowns_total";

pub const PORT_POOL_IN_USE: &str = "navigator_port_pool_in_use";
pub const PORT_POOL_CAPACITY: &str = "navigator_port_pool_capacity";

pub const FLY_REPLAY_EMITTED_TOTAL: &str = "navigator_fly_replay_emitted_total";

pub const WEBSOCKET_SESSIONS_OPENED_TOTAL: &str = "navigator_websocket_sessions_opened_total";
pub const WEBSOCKET_SESSIONS_CLOSED_TOTAL: &str = "navigator_websocket_sessions_closed_total";

/// Installs the global recorder. Called once from `main`.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new().install_recorder().expect("failed to install prometheus recorder");

    describe_counter!(REQUESTS_TOTAL, "Total requests handled, labeled by response_type and status");
    describe_histogram!(REQUEST_DURATION_SECONDS, "Request handling duration in seconds");

    describe_counter!(TENANT_STARTS_TOTAL, "Total tenant process spawns attempted");
    describe_counter!(TENANT_START_FAILURES_TOTAL, "Total tenant process spawns that failed readiness");
    describe_gauge!(TENANT_INSTANCES_RUNNING, "Tenant processes currently running");
    describe_counter!(TENANT_IDLE_SHUTDOWNS_TOTAL, "Total tenant processes stopped by the idle sweep");

    describe_gauge!(PORT_POOL_IN_USE, "Ports currently assigned from the tenant port pool");
    describe_gauge!(PORT_POOL_CAPACITY, "Total size of the tenant port pool");

    describe_counter!(FLY_REPLAY_EMITTED_TOTAL, "Total fly-replay responses emitted, labeled by target kind");

    describe_counter!(WEBSOCKET_SESSIONS_OPENED_TOTAL, "Total WebSocket sessions successfully bridged to a backend");
    describe_counter!(WEBSOCKET_SESSIONS_CLOSED_TOTAL, "Total WebSocket sessions that ended");

    handle
}

pub fn record_request(response_type: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(REQUESTS_TOTAL, "response_type" => response_type.to_string(), "status" => status.clone()).increment(1);
    histogram!(REQUEST_DURATION_SECONDS, "response_type" => response_type.to_string()).record(duration_secs);
}

pub fn record_tenant_start_attempt() {
    counter!(TENANT_STARTS_TOTAL).increment(1);
}

pub fn record_tenant_start_failure() {
    counter!(TENANT_START_FAILURES_TOTAL).increment(1);
}

pub fn record_tenant_idle_shutdown() {
    counter!(TENANT_IDLE_SHUTDOWNS_TOTAL).increment(1);
}

pub fn set_tenant_instances_running(count: usize) {
    gauge!(TENANT_INSTANCES_RUNNING).set(count as f64);
}

pub fn set_port_pool_usage(in_use: usize, capacity: usize) {
    gauge!(PORT_POOL_IN_USE).set(in_use as f64);
    gauge!(PORT_POOL_CAPACITY).set(capacity as f64);
}

pub fn record_fly_replay(target_kind: &str) {
    counter!(FLY_REPLAY_EMITTED_TOTAL, "target" => target_kind.to_string()).increment(1);
}

pub fn record_websocket_opened() {
    counter!(WEBSOCKET_SESSIONS_OPENED_TOTAL).increment(1);
}

pub fn record_websocket_closed() {
    counter!(WEBSOCKET_SESSIONS_CLOSED_TOTAL).increment(1);
}

/// GET /metrics handler, wired up alongside the reverse proxy listener.
pub async fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_prometheus_conventions() {
        assert!(REQUESTS_TOTAL.ends_with("_total"));
        assert!(REQUEST_DURATION_SECONDS.ends_with("_seconds"));
        assert!(TENANT_STARTS_TOTAL.ends_with("_total"));
    }
}
