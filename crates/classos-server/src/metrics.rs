//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants.

/// WebSocket sessions opened (counter, labels: role).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket sessions closed (counter, labels: role).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live WebSocket sessions (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Session lifetime (histogram).
pub const WS_SESSION_DURATION_SECONDS: &str = "ws_session_duration_seconds";
/// Upgrade requests refused by the gate (counter, labels: code).
pub const WS_AUTH_FAILURES_TOTAL: &str = "ws_auth_failures_total";
/// Frames routed successfully (counter, labels: message_type).
pub const ROUTED_MESSAGES_TOTAL: &str = "routed_messages_total";
/// Frames the router rejected (counter, labels: kind).
pub const ROUTE_ERRORS_TOTAL: &str = "route_errors_total";
/// Sessions evicted for a full outbound queue (counter).
pub const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";
/// Sessions removed by the stale sweep (counter).
pub const HUB_STALE_SWEPT_TOTAL: &str = "hub_stale_swept_total";
