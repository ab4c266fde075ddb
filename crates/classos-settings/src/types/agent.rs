//! Agent connection settings.

use std::time::Duration;

use classos_core::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, ReconnectPolicy};
use serde::{Deserialize, Serialize};

/// Settings for the `classos-agent` process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Broker upgrade endpoint.
    pub server_url: String,
    /// Credential of the form `device_<agentID>`.
    pub device_token: String,
    /// Heartbeat cadence, in ms.
    pub heartbeat_interval_ms: u64,
    /// First reconnect delay, in ms.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap, in ms.
    pub reconnect_max_delay_ms: u64,
    /// Upper bound on any single socket write, in ms.
    pub write_timeout_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            device_token: String::new(),
            heartbeat_interval_ms: 30_000,
            reconnect_base_delay_ms: DEFAULT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_MAX_DELAY_MS,
            write_timeout_ms: 10_000,
        }
    }
}

impl AgentSettings {
    /// Backoff parameters for reconnects.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
        }
    }

    /// `heartbeat_interval_ms` as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `write_timeout_ms` as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
