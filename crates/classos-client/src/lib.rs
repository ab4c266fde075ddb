//! # classos-client
//!
//! Agent-side counterpart of the classos broker.
//!
//! - Dials the broker with a `device_<id>` credential
//! - Reconnects with exponential backoff after any connection loss
//! - Sends periodic heartbeats and dispatches inbound envelopes to
//!   per-type [`MessageHandler`]s
//! - One shared cancellation signal ([`AgentClient::close`]) stops everything

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod handler;

pub use client::{AgentClient, ConnectionState, HeartbeatSource};
pub use config::ClientConfig;
pub use error::ClientError;
pub use handler::MessageHandler;
