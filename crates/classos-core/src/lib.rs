//! # classos-core
//!
//! Shared vocabulary for the classos broker, admin consoles and agents.
//!
//! - **Envelope**: [`Envelope`] wire container with a type tag and opaque payload
//! - **Messages**: [`Message`] closed tagged variant over every message type,
//!   each carrying its strongly typed payload
//! - **Channels**: [`Role`] and the `admin::dashboard` / `agent::<id>` naming
//! - **Errors**: [`ProtocolError`] via `thiserror`
//! - **Retry**: bounded exponential backoff for reconnecting clients
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod channel;
pub mod envelope;
pub mod errors;
pub mod logging;
pub mod payloads;
pub mod retry;

pub use channel::{ADMIN_DASHBOARD, Role, agent_channel, agent_id_from_channel};
pub use envelope::{Envelope, Message, MessageType};
pub use errors::ProtocolError;
pub use payloads::{
    ActionLogPayload, AgentPresence, AgentStatusPayload, CommandRequestPayload,
    CommandResponsePayload, HeartbeatPayload, StatusUpdatePayload,
};
