//! Typed payloads, one per message type.
//!
//! Payloads travel as the opaque `payload` field of an
//! [`Envelope`](crate::Envelope) and are only decoded by whoever handles
//! that type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Periodic liveness report from an agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Free-form agent status, usually `"online"`.
    pub status: String,
    /// CPU usage percentage.
    #[serde(default)]
    pub cpu_usage: f64,
    /// Memory usage percentage.
    #[serde(default)]
    pub memory_usage: f64,
    /// User logged in on the device.
    #[serde(default)]
    pub username: String,
    /// Device hostname. The agent id stands in when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// An agent changed state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    /// Previous state.
    pub old_status: String,
    /// New state.
    pub new_status: String,
    /// Why the state changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A policy decision taken on the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLogPayload {
    /// What was attempted, e.g. `"open_site"`.
    pub action: String,
    /// What it was attempted on.
    pub resource: String,
    /// Who attempted it.
    pub username: String,
    /// Whether policy allowed it.
    pub allowed: bool,
    /// Extra details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Admin asks an agent to do something.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequestPayload {
    /// Command name, e.g. `"get_processes"`.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub params: Value,
    /// Seconds the admin is willing to wait for a response. Zero means unset.
    #[serde(default)]
    pub timeout: u64,
    /// Target agent, used when the envelope carries no `agent_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Agent's answer to a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResponsePayload {
    /// Whether the command ran.
    pub success: bool,
    /// Command output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Online/offline state the broker reports for an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPresence {
    /// The agent has a live session.
    Online,
    /// The agent's last session went away.
    Offline,
}

/// Broker-synthesized presence notice for admin consoles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusPayload {
    /// Agent the notice is about.
    pub agent_id: String,
    /// Device hostname.
    pub hostname: String,
    /// Current presence.
    pub status: AgentPresence,
    /// When the agent was last heard from.
    pub last_seen: DateTime<Utc>,
    /// User logged in on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}
