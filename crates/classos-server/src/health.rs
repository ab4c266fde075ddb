//! `/health` and `/ws/status` bodies.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::websocket::HubStatus;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket sessions.
    pub connections: usize,
    /// Live channels.
    pub channels: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, channels: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        channels,
    }
}

/// Operational report of the channel map.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Always `"running"`.
    pub status: String,
    /// Number of live channels.
    pub total_channels: usize,
    /// Member count per channel.
    pub channels: BTreeMap<String, usize>,
}

impl From<HubStatus> for StatusResponse {
    fn from(hub: HubStatus) -> Self {
        Self {
            status: "running".into(),
            total_channels: hub.total_channels,
            channels: hub.channels,
        }
    }
}
