//! Persistence collaborator for accepted agent events.
//!
//! The broker never owns storage. Whatever sits behind [`EventSink`]
//! (a database, a log shipper) receives heartbeats and action logs after
//! they have been accepted; its failures are logged and never affect
//! delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classos_core::ActionLogPayload;
use parking_lot::Mutex;
use thiserror::Error;

/// Device status derived from a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHeartbeat {
    /// Reporting agent.
    pub agent_id: String,
    /// Device hostname.
    pub hostname: String,
    /// User logged in on the device.
    pub username: String,
    /// Agent-reported status.
    pub status: String,
    /// CPU usage percentage.
    pub cpu_usage: f64,
    /// Memory usage percentage.
    pub memory_usage: f64,
    /// Heartbeat timestamp.
    pub at: DateTime<Utc>,
}

/// An action log attributed to the agent that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentActionLog {
    /// Reporting agent.
    pub agent_id: String,
    /// The logged decision.
    pub entry: ActionLogPayload,
    /// Event timestamp.
    pub at: DateTime<Utc>,
}

/// Error reported by a sink implementation.
#[derive(Debug, Error)]
#[error("event sink failure: {0}")]
pub struct SinkError(pub String);

/// Receives accepted agent events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Upsert the device status for a heartbeat.
    async fn record_heartbeat(&self, heartbeat: DeviceHeartbeat) -> Result<(), SinkError>;

    /// Append an action log entry.
    async fn record_action_log(&self, log: AgentActionLog) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record_heartbeat(&self, _heartbeat: DeviceHeartbeat) -> Result<(), SinkError> {
        Ok(())
    }

    async fn record_action_log(&self, _log: AgentActionLog) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps events in memory. Holds the latest heartbeat per agent and every
/// action log.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    heartbeats: Mutex<Vec<DeviceHeartbeat>>,
    action_logs: Mutex<Vec<AgentActionLog>>,
}

impl MemoryEventSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest heartbeat of every agent seen so far.
    pub fn devices(&self) -> Vec<DeviceHeartbeat> {
        self.heartbeats.lock().clone()
    }

    /// Latest heartbeat of one agent.
    pub fn device(&self, agent_id: &str) -> Option<DeviceHeartbeat> {
        self.heartbeats
            .lock()
            .iter()
            .find(|h| h.agent_id == agent_id)
            .cloned()
    }

    /// Every action log, oldest first.
    pub fn action_logs(&self) -> Vec<AgentActionLog> {
        self.action_logs.lock().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record_heartbeat(&self, heartbeat: DeviceHeartbeat) -> Result<(), SinkError> {
        let mut devices = self.heartbeats.lock();
        match devices.iter_mut().find(|h| h.agent_id == heartbeat.agent_id) {
            Some(existing) => *existing = heartbeat,
            None => devices.push(heartbeat),
        }
        Ok(())
    }

    async fn record_action_log(&self, log: AgentActionLog) -> Result<(), SinkError> {
        self.action_logs.lock().push(log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(agent_id: &str, username: &str) -> DeviceHeartbeat {
        DeviceHeartbeat {
            agent_id: agent_id.into(),
            hostname: agent_id.into(),
            username: username.into(),
            status: "online".into(),
            cpu_usage: 1.0,
            memory_usage: 2.0,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_sink_upserts_devices() {
        let sink = MemoryEventSink::new();
        sink.record_heartbeat(beat("A1", "alice")).await.unwrap();
        sink.record_heartbeat(beat("A2", "bob")).await.unwrap();
        sink.record_heartbeat(beat("A1", "carol")).await.unwrap();

        assert_eq!(sink.devices().len(), 2);
        assert_eq!(sink.device("A1").unwrap().username, "carol");
        assert!(sink.device("A3").is_none());
    }

    #[tokio::test]
    async fn memory_sink_appends_action_logs() {
        let sink = MemoryEventSink::new();
        for allowed in [true, false] {
            sink.record_action_log(AgentActionLog {
                agent_id: "A1".into(),
                entry: ActionLogPayload {
                    action: "open_site".into(),
                    resource: "example.org".into(),
                    username: "alice".into(),
                    allowed,
                    metadata: None,
                },
                at: Utc::now(),
            })
            .await
            .unwrap();
        }
        let logs = sink.action_logs();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].entry.allowed);
        assert!(!logs[1].entry.allowed);
    }

    #[tokio::test]
    async fn noop_sink_accepts_everything() {
        assert!(NoopEventSink.record_heartbeat(beat("A1", "x")).await.is_ok());
    }
}
