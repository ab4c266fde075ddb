//! Message-type dispatch.
//!
//! Each inbound frame is decoded into an [`Envelope`], checked against the
//! sender's role, decoded into its typed payload and turned into hub
//! actions:
//!
//! | Type               | Sender | Action                                           |
//! |--------------------|--------|--------------------------------------------------|
//! | `heartbeat`        | agent  | refresh liveness, broadcast `agent_status`       |
//! | `status_update`    | agent  | forward to `admin::dashboard`                    |
//! | `action_log`       | agent  | persist, forward to `admin::dashboard`           |
//! | `command_request`  | admin  | send to `agent::<id>`                            |
//! | `command_response` | agent  | back to the requesting admin, else the dashboard |
//!
//! A rejected frame has no side effects and never closes the connection.

use std::sync::Arc;
use std::time::Duration;

use classos_core::{
    ADMIN_DASHBOARD, ActionLogPayload, AgentPresence, AgentStatusPayload, CommandRequestPayload,
    Envelope, HeartbeatPayload, Message, MessageType, ProtocolError, Role, agent_channel,
};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use super::pending::PendingRequests;
use crate::metrics::{ROUTE_ERRORS_TOTAL, ROUTED_MESSAGES_TOTAL};
use crate::sink::{AgentActionLog, DeviceHeartbeat, EventSink};
use crate::websocket::hub::Hub;
use crate::websocket::session::Session;

/// Why a frame was dropped.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The frame or its payload is malformed.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// The `type` tag is outside the closed set.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The sender's role may not send this type.
    #[error("{role} may not send {message_type}")]
    Forbidden {
        /// Sender role.
        role: Role,
        /// Offending type.
        message_type: MessageType,
    },

    /// A `command_request` without an agent to send it to.
    #[error("command_request names no target agent")]
    MissingTarget,
}

impl RouteError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::Decode(_) => "decode",
            RouteError::UnknownMessageType(_) => "unknown_message_type",
            RouteError::Forbidden { .. } => "forbidden",
            RouteError::MissingTarget => "missing_target",
        }
    }
}

/// The only role allowed to originate `kind`. `None` means no client may.
fn sender_role(kind: MessageType) -> Option<Role> {
    match kind {
        MessageType::CommandRequest => Some(Role::Admin),
        MessageType::Heartbeat
        | MessageType::StatusUpdate
        | MessageType::ActionLog
        | MessageType::CommandResponse => Some(Role::Agent),
        MessageType::AgentStatus => None,
    }
}

/// Translates inbound frames into hub actions.
pub struct MessageRouter {
    hub: Hub,
    sink: Arc<dyn EventSink>,
    pending: PendingRequests,
}

impl MessageRouter {
    /// Router over `hub`, persisting through `sink`. Pending commands
    /// without their own timeout are remembered for `pending_ttl`.
    pub fn new(hub: Hub, sink: Arc<dyn EventSink>, pending_ttl: Duration) -> Self {
        Self {
            hub,
            sink,
            pending: PendingRequests::new(pending_ttl),
        }
    }

    /// The hub this router delivers through.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Outstanding command requests.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Route one text frame received from `session`.
    pub async fn route(&self, session: &Session, raw: &str) -> Result<(), RouteError> {
        match self.dispatch(session, raw).await {
            Ok(kind) => {
                counter!(ROUTED_MESSAGES_TOTAL, "message_type" => kind.as_str()).increment(1);
                Ok(())
            }
            Err(err) => {
                counter!(ROUTE_ERRORS_TOTAL, "kind" => err.kind()).increment(1);
                warn!(
                    client_id = session.client_id(),
                    role = %session.role(),
                    error = %err,
                    "dropping frame"
                );
                Err(err)
            }
        }
    }

    async fn dispatch(&self, session: &Session, raw: &str) -> Result<MessageType, RouteError> {
        let envelope = Envelope::from_json(raw)?;
        let kind = envelope
            .kind()
            .map_err(|_| RouteError::UnknownMessageType(envelope.message_type.clone()))?;

        if sender_role(kind) != Some(session.role()) {
            return Err(RouteError::Forbidden {
                role: session.role(),
                message_type: kind,
            });
        }

        debug!(client_id = session.client_id(), message_type = %kind, "routing");
        match envelope.decode()? {
            Message::Heartbeat(payload) => self.on_heartbeat(session, &envelope, payload).await?,
            Message::StatusUpdate(_) => self.forward_to_dashboard(session, envelope, raw),
            Message::ActionLog(payload) => {
                self.on_action_log(session, envelope, raw, payload).await;
            }
            Message::CommandRequest(payload) => {
                self.on_command_request(session, envelope, raw, &payload)?;
            }
            Message::CommandResponse(_) => self.on_command_response(session, envelope, raw),
            Message::AgentStatus(_) => {
                return Err(RouteError::Forbidden {
                    role: session.role(),
                    message_type: kind,
                });
            }
        }
        Ok(kind)
    }

    async fn on_heartbeat(
        &self,
        session: &Session,
        envelope: &Envelope,
        payload: HeartbeatPayload,
    ) -> Result<(), RouteError> {
        session.touch();

        let agent_id = session.client_id().to_string();
        let hostname = payload
            .hostname
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| agent_id.clone());
        let status = AgentStatusPayload {
            agent_id: agent_id.clone(),
            hostname: hostname.clone(),
            status: AgentPresence::Online,
            last_seen: envelope.timestamp,
            username: (!payload.username.is_empty()).then(|| payload.username.clone()),
        };
        let notice = Envelope::new(MessageType::AgentStatus, &status)?.with_agent_id(&agent_id);
        let _ = self.hub.broadcast_to_channel(ADMIN_DASHBOARD, &notice);

        let heartbeat = DeviceHeartbeat {
            agent_id,
            hostname,
            username: payload.username,
            status: payload.status,
            cpu_usage: payload.cpu_usage,
            memory_usage: payload.memory_usage,
            at: envelope.timestamp,
        };
        if let Err(err) = self.sink.record_heartbeat(heartbeat).await {
            warn!(client_id = session.client_id(), error = %err, "failed to persist heartbeat");
        }
        Ok(())
    }

    async fn on_action_log(
        &self,
        session: &Session,
        envelope: Envelope,
        raw: &str,
        payload: ActionLogPayload,
    ) {
        let log = AgentActionLog {
            agent_id: session.client_id().to_string(),
            entry: payload,
            at: envelope.timestamp,
        };
        if let Err(err) = self.sink.record_action_log(log).await {
            warn!(client_id = session.client_id(), error = %err, "failed to persist action log");
        }
        self.forward_to_dashboard(session, envelope, raw);
    }

    fn forward_to_dashboard(&self, session: &Session, envelope: Envelope, raw: &str) {
        if let Some(frame) = attributed(session, envelope, raw) {
            let _ = self.hub.broadcast_frame(ADMIN_DASHBOARD, frame);
        }
    }

    fn on_command_request(
        &self,
        session: &Session,
        envelope: Envelope,
        raw: &str,
        payload: &CommandRequestPayload,
    ) -> Result<(), RouteError> {
        let from_envelope = envelope.agent_id.as_deref().filter(|id| !id.is_empty());
        let target = from_envelope
            .or(payload.agent_id.as_deref().filter(|id| !id.is_empty()))
            .map(str::to_string)
            .ok_or(RouteError::MissingTarget)?;

        let frame: Arc<str> = if from_envelope.is_some() {
            Arc::from(raw)
        } else {
            Arc::from(envelope.clone().with_agent_id(&target).to_json()?)
        };

        let request_id = envelope.request_id.as_deref();
        if let Some(request_id) = request_id {
            let ttl = (payload.timeout > 0).then(|| Duration::from_secs(payload.timeout));
            if !self.pending.insert(request_id, session.id(), ttl) {
                debug!(request_id, "request id already pending for another console");
            }
        }

        let channel = agent_channel(&target);
        if self.hub.send_frame_to_channel(&channel, frame) {
            debug!(agent_id = %target, command = %payload.command, request_id, "command delivered");
        } else {
            debug!(agent_id = %target, command = %payload.command, "no session for target agent");
            if let Some(request_id) = request_id {
                self.pending.forget(request_id, session.id());
            }
        }
        Ok(())
    }

    fn on_command_response(&self, session: &Session, envelope: Envelope, raw: &str) {
        let request_id = envelope.request_id.clone();
        let Some(frame) = attributed(session, envelope, raw) else {
            return;
        };

        if let Some(admin) = request_id.as_deref().and_then(|id| self.pending.take(id)) {
            if self.hub.send_frame_to_session(ADMIN_DASHBOARD, admin, Arc::clone(&frame)) {
                return;
            }
            debug!(request_id, "requesting admin is gone, broadcasting response");
        }
        let _ = self.hub.broadcast_frame(ADMIN_DASHBOARD, frame);
    }
}

/// The frame to forward for an agent-originated envelope, with `agent_id`
/// set to the authenticated sender. Reuses the raw text when it already is.
fn attributed(session: &Session, mut envelope: Envelope, raw: &str) -> Option<Arc<str>> {
    if envelope.agent_id.as_deref() == Some(session.client_id()) {
        return Some(Arc::from(raw));
    }
    envelope.agent_id = Some(session.client_id().to_string());
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            warn!(error = %err, "failed to re-encode envelope");
            None
        }
    }
}
