//! # classos-server
//!
//! Axum WebSocket broker between admin consoles and lab agents.
//!
//! - Authorization gate: device tokens and admin JWTs resolve to a role and channel
//! - Hub: `admin::dashboard` and `agent::<id>` channels with non-blocking fan-out
//! - Sessions: bounded outbound queues, write bursts, ping/pong liveness
//! - Router: typed decode, role checks, dashboard broadcast and targeted commands
//! - HTTP endpoints: health, channel status, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod websocket;

pub use auth::{AuthError, AuthGate, DeviceDirectory, Identity, OpenDirectory, StaticDirectory};
pub use config::{BrokerConfig, SessionTiming};
pub use routing::{MessageRouter, RouteError};
pub use server::BrokerServer;
pub use shutdown::ShutdownCoordinator;
pub use sink::{EventSink, MemoryEventSink, NoopEventSink};
pub use websocket::{Hub, Session};
