//! The wire envelope and the closed set of message types.
//!
//! An [`Envelope`] is what travels in every text frame. Its `payload` stays
//! an untyped JSON value until someone asks for it with
//! [`Envelope::decode_payload`] or [`Envelope::decode`], so the broker can
//! forward messages it does not need to inspect without re-encoding them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};
use crate::payloads::{
    ActionLogPayload, AgentStatusPayload, CommandRequestPayload, CommandResponsePayload,
    HeartbeatPayload, StatusUpdatePayload,
};

// ─────────────────────────────────────────────────────────────────────────────
// Message types
// ─────────────────────────────────────────────────────────────────────────────

/// Tag of every message the system understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Agent liveness report.
    Heartbeat,
    /// Agent state change.
    StatusUpdate,
    /// Agent policy decision.
    ActionLog,
    /// Admin to agent command.
    CommandRequest,
    /// Agent to admin command result.
    CommandResponse,
    /// Broker to admin presence notice.
    AgentStatus,
}

impl MessageType {
    /// Every message type, in wire order.
    pub const ALL: [MessageType; 6] = [
        MessageType::Heartbeat,
        MessageType::StatusUpdate,
        MessageType::ActionLog,
        MessageType::CommandRequest,
        MessageType::CommandResponse,
        MessageType::AgentStatus,
    ];

    /// Wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::StatusUpdate => "status_update",
            MessageType::ActionLog => "action_log",
            MessageType::CommandRequest => "command_request",
            MessageType::CommandResponse => "command_response",
            MessageType::AgentStatus => "agent_status",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// One message on the wire.
///
/// `message_type` is kept as a raw string so that frames carrying a type
/// outside the closed set still parse and can be reported as unknown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Type-specific payload, decoded lazily.
    #[serde(default)]
    pub payload: Value,
    /// When the sender produced the message.
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    /// Agent the message is from or addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Correlates a `command_request` with its `command_response`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    /// Wrap a typed payload, stamped with the current time.
    pub fn new<P: Serialize>(message_type: MessageType, payload: &P) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(ProtocolError::Encode)?;
        Ok(Self {
            message_type: message_type.as_str().to_string(),
            payload,
            timestamp: Utc::now(),
            agent_id: None,
            request_id: None,
        })
    }

    /// Set the `agent_id` field.
    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the `request_id` field.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Parse a text frame.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(ProtocolError::Envelope)
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// The type tag, if it is one of the known types.
    pub fn kind(&self) -> Result<MessageType> {
        self.message_type.parse()
    }

    /// Decode the payload as `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let message_type = self.kind()?;
        T::deserialize(&self.payload)
            .map_err(|source| ProtocolError::Payload { message_type, source })
    }

    /// Decode into the tagged variant matching the type tag.
    pub fn decode(&self) -> Result<Message> {
        Ok(match self.kind()? {
            MessageType::Heartbeat => Message::Heartbeat(self.decode_payload()?),
            MessageType::StatusUpdate => Message::StatusUpdate(self.decode_payload()?),
            MessageType::ActionLog => Message::ActionLog(self.decode_payload()?),
            MessageType::CommandRequest => Message::CommandRequest(self.decode_payload()?),
            MessageType::CommandResponse => Message::CommandResponse(self.decode_payload()?),
            MessageType::AgentStatus => Message::AgentStatus(self.decode_payload()?),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed messages
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded message: the type tag together with its typed payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// See [`HeartbeatPayload`].
    Heartbeat(HeartbeatPayload),
    /// See [`StatusUpdatePayload`].
    StatusUpdate(StatusUpdatePayload),
    /// See [`ActionLogPayload`].
    ActionLog(ActionLogPayload),
    /// See [`CommandRequestPayload`].
    CommandRequest(CommandRequestPayload),
    /// See [`CommandResponsePayload`].
    CommandResponse(CommandResponsePayload),
    /// See [`AgentStatusPayload`].
    AgentStatus(AgentStatusPayload),
}

impl Message {
    /// Tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::StatusUpdate(_) => MessageType::StatusUpdate,
            Message::ActionLog(_) => MessageType::ActionLog,
            Message::CommandRequest(_) => MessageType::CommandRequest,
            Message::CommandResponse(_) => MessageType::CommandResponse,
            Message::AgentStatus(_) => MessageType::AgentStatus,
        }
    }

    /// Wrap into a fresh envelope.
    pub fn into_envelope(self) -> Result<Envelope> {
        let kind = self.message_type();
        match self {
            Message::Heartbeat(p) => Envelope::new(kind, &p),
            Message::StatusUpdate(p) => Envelope::new(kind, &p),
            Message::ActionLog(p) => Envelope::new(kind, &p),
            Message::CommandRequest(p) => Envelope::new(kind, &p),
            Message::CommandResponse(p) => Envelope::new(kind, &p),
            Message::AgentStatus(p) => Envelope::new(kind, &p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::AgentPresence;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn heartbeat() -> HeartbeatPayload {
        HeartbeatPayload {
            status: "online".into(),
            cpu_usage: 37.5,
            memory_usage: 61.25,
            username: "alice".into(),
            hostname: Some("lab-pc-07".into()),
        }
    }

    #[test]
    fn message_type_parse_covers_closed_set() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert_matches!("file_upload".parse::<MessageType>(), Err(ProtocolError::UnknownType(t)) if t == "file_upload");
    }

    #[test]
    fn message_type_serde_matches_as_str() {
        for t in MessageType::ALL {
            assert_eq!(serde_json::to_value(t).unwrap(), t.as_str());
        }
    }

    #[test]
    fn heartbeat_survives_the_wire() {
        let env = Envelope::new(MessageType::Heartbeat, &heartbeat())
            .unwrap()
            .with_agent_id("A1");
        let wire = env.to_json().unwrap();
        let back = Envelope::from_json(&wire).unwrap();

        assert_eq!(back, env);
        assert_eq!(back.decode().unwrap(), Message::Heartbeat(heartbeat()));
    }

    #[test]
    fn wire_shape_uses_type_key_and_omits_absent_ids() {
        let env = Envelope::new(MessageType::Heartbeat, &heartbeat()).unwrap();
        let v: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "heartbeat");
        assert!(v.get("agent_id").is_none());
        assert!(v.get("request_id").is_none());
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn parses_frame_from_browser_console() {
        let raw = r#"{
            "type": "command_request",
            "payload": {"command": "get_processes", "params": {}, "timeout": 30},
            "timestamp": "2025-01-15T10:30:00Z",
            "agent_id": "A1",
            "request_id": "req-17"
        }"#;
        let env = Envelope::from_json(raw).unwrap();
        assert_eq!(env.kind().unwrap(), MessageType::CommandRequest);
        assert_eq!(env.agent_id.as_deref(), Some("A1"));
        assert_eq!(env.request_id.as_deref(), Some("req-17"));
        let req: CommandRequestPayload = env.decode_payload().unwrap();
        assert_eq!(req.command, "get_processes");
        assert_eq!(req.timeout, 30);
    }

    #[test]
    fn null_ids_are_treated_as_absent() {
        let raw = r#"{"type":"heartbeat","payload":{"status":"online"},"agent_id":null,"request_id":null}"#;
        let env = Envelope::from_json(raw).unwrap();
        assert!(env.agent_id.is_none());
        assert!(env.request_id.is_none());
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let env = Envelope::from_json(r#"{"type":"heartbeat","payload":{"status":"online"}}"#).unwrap();
        assert!(env.timestamp >= before);
    }

    #[test]
    fn unknown_type_still_parses_as_envelope() {
        let env = Envelope::from_json(r#"{"type":"screenshot","payload":{}}"#).unwrap();
        assert_matches!(env.kind(), Err(ProtocolError::UnknownType(_)));
        assert_matches!(env.decode(), Err(ProtocolError::UnknownType(_)));
    }

    #[test]
    fn garbage_is_an_envelope_error() {
        assert_matches!(Envelope::from_json("not json"), Err(ProtocolError::Envelope(_)));
        assert_matches!(Envelope::from_json(r#"{"payload":{}}"#), Err(ProtocolError::Envelope(_)));
    }

    #[test]
    fn mismatched_payload_reports_type() {
        let env = Envelope::from_json(r#"{"type":"action_log","payload":{"action":1}}"#).unwrap();
        assert_matches!(
            env.decode(),
            Err(ProtocolError::Payload { message_type: MessageType::ActionLog, .. })
        );
    }

    #[test]
    fn message_into_envelope_keeps_tag() {
        let status = AgentStatusPayload {
            agent_id: "A1".into(),
            hostname: "A1".into(),
            status: AgentPresence::Offline,
            last_seen: Utc::now(),
            username: None,
        };
        let env = Message::AgentStatus(status.clone()).into_envelope().unwrap();
        assert_eq!(env.message_type, "agent_status");
        assert_eq!(env.payload["status"], json!("offline"));
        assert_eq!(env.decode().unwrap(), Message::AgentStatus(status));
    }
}
