//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON is fine and missing fields get their production default.

mod agent;
mod broker;

pub use agent::AgentSettings;
pub use broker::BrokerSettings;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "broker": { "port": 9090, "jwtSecret": "..." },
///   "agent": { "serverUrl": "ws://broker:9090/ws", "deviceToken": "device_lab-01" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassosSettings {
    /// Broker process settings.
    pub broker: BrokerSettings,
    /// Agent process settings.
    pub agent: AgentSettings,
}

impl ClassosSettings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        let b = &self.broker;
        if b.ping_interval_ms >= b.pong_wait_ms {
            return Err(SettingsError::InvalidValue(format!(
                "broker.pingIntervalMs ({}) must be shorter than broker.pongWaitMs ({})",
                b.ping_interval_ms, b.pong_wait_ms
            )));
        }
        if b.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if b.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.maxMessageSize must be at least 1".into(),
            ));
        }
        if b.stale_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "broker.staleTimeoutSecs must be at least 1".into(),
            ));
        }

        let a = &self.agent;
        if a.reconnect_base_delay_ms > a.reconnect_max_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "agent.reconnectBaseDelayMs ({}) exceeds agent.reconnectMaxDelayMs ({})",
                a.reconnect_base_delay_ms, a.reconnect_max_delay_ms
            )));
        }
        if a.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "agent.heartbeatIntervalMs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        ClassosSettings::default().validate().unwrap();
    }

    #[test]
    fn ping_must_be_shorter_than_pong_wait() {
        let mut s = ClassosSettings::default();
        s.broker.ping_interval_ms = s.broker.pong_wait_ms;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("pingIntervalMs"));
    }

    #[test]
    fn zero_queue_rejected() {
        let mut s = ClassosSettings::default();
        s.broker.send_queue_capacity = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn base_delay_above_cap_rejected() {
        let mut s = ClassosSettings::default();
        s.agent.reconnect_base_delay_ms = 60_000;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("reconnectBaseDelayMs"));
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(ClassosSettings::default()).unwrap();
        assert!(v["broker"].get("pongWaitMs").is_some());
        assert!(v["agent"].get("heartbeatIntervalMs").is_some());
    }
}
