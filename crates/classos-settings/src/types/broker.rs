//! Broker network, liveness and logging settings.

use std::time::Duration;

use classos_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Settings for the `classos-broker` process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// HMAC key admin tokens are signed with.
    pub jwt_secret: String,
    /// Upper bound on any single socket write, in ms.
    pub write_wait_ms: u64,
    /// Read-liveness deadline, in ms.
    pub pong_wait_ms: u64,
    /// Ping cadence, in ms. Must be below `pong_wait_ms`.
    pub ping_interval_ms: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Per-session outbound queue depth.
    pub send_queue_capacity: usize,
    /// Sessions silent for longer than this are swept, in seconds.
    pub stale_timeout_secs: u64,
    /// Lifetime of a pending command when it carries no timeout, in seconds.
    pub pending_request_ttl_secs: u64,
    /// Default log filter.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            jwt_secret: String::new(),
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            ping_interval_ms: 30_000,
            max_message_size: 512 * 1024,
            send_queue_capacity: 256,
            stale_timeout_secs: 90,
            pending_request_ttl_secs: 120,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

impl BrokerSettings {
    /// `write_wait_ms` as a [`Duration`].
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// `pong_wait_ms` as a [`Duration`].
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// `ping_interval_ms` as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// `stale_timeout_secs` as a [`Duration`].
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    /// `pending_request_ttl_secs` as a [`Duration`].
    pub fn pending_request_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_request_ttl_secs)
    }
}
