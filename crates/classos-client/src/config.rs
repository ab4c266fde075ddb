//! Agent client configuration.

use std::time::Duration;

use classos_core::retry::ReconnectPolicy;
use classos_settings::AgentSettings;

/// Where and how the agent connects.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Broker upgrade endpoint, e.g. `ws://broker:8080/ws`.
    pub server_url: String,
    /// Device credential, sent as the `token` query parameter.
    pub device_token: String,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Upper bound on any single socket write.
    pub write_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Config for `server_url` with default timings.
    pub fn new(server_url: impl Into<String>, device_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            device_token: device_token.into(),
            ..Self::from_settings(&AgentSettings::default())
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            device_token: settings.device_token.clone(),
            heartbeat_interval: settings.heartbeat_interval(),
            write_timeout: settings.write_timeout(),
            reconnect: settings.reconnect_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_keeps_default_timings() {
        let cfg = ClientConfig::new("ws://broker/ws", "device_lab-01");
        assert_eq!(cfg.server_url, "ws://broker/ws");
        assert_eq!(cfg.device_token, "device_lab-01");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn from_settings_copies_everything() {
        let settings = AgentSettings {
            server_url: "ws://10.0.0.5:9000/ws".into(),
            device_token: "device_pc-7".into(),
            heartbeat_interval_ms: 5_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 8_000,
            write_timeout_ms: 2_000,
        };
        let cfg = ClientConfig::from_settings(&settings);
        assert_eq!(cfg.server_url, "ws://10.0.0.5:9000/ws");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.write_timeout, Duration::from_secs(2));
        assert_eq!(cfg.reconnect.base_delay_ms, 500);
        assert_eq!(cfg.reconnect.max_delay_ms, 8_000);
    }
}
