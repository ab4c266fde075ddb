//! Broker runtime configuration.

use std::time::Duration;

use classos_settings::BrokerSettings;

/// Per-connection liveness and I/O limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTiming {
    /// Upper bound on any single write burst.
    pub write_wait: Duration,
    /// A session that sends nothing (not even a pong) for this long is dropped.
    pub pong_wait: Duration,
    /// Ping cadence; shorter than `pong_wait`.
    pub ping_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for the broker server.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// HMAC key for admin tokens.
    pub jwt_secret: String,
    /// Liveness and write limits.
    pub timing: SessionTiming,
    /// Largest inbound frame, in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per session.
    pub send_queue_capacity: usize,
    /// Silence after which the sweep removes a session.
    pub stale_timeout: Duration,
    /// Lifetime of a pending command without its own timeout.
    pub pending_request_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            jwt_secret: String::new(),
            timing: SessionTiming::default(),
            max_message_size: 512 * 1024,
            send_queue_capacity: 256,
            stale_timeout: Duration::from_secs(90),
            pending_request_ttl: Duration::from_secs(120),
        }
    }
}

impl BrokerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            jwt_secret: settings.jwt_secret.clone(),
            timing: SessionTiming {
                write_wait: settings.write_wait(),
                pong_wait: settings.pong_wait(),
                ping_interval: settings.ping_interval(),
            },
            max_message_size: settings.max_message_size,
            send_queue_capacity: settings.send_queue_capacity,
            stale_timeout: settings.stale_timeout(),
            pending_request_ttl: settings.pending_request_ttl(),
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_ephemeral() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn default_timing() {
        let t = SessionTiming::default();
        assert!(t.ping_interval < t.pong_wait);
        assert_eq!(t.write_wait, Duration::from_secs(10));
    }

    #[test]
    fn from_settings_copies_everything() {
        let settings = BrokerSettings {
            host: "0.0.0.0".into(),
            port: 9000,
            jwt_secret: "k".into(),
            ping_interval_ms: 5_000,
            pong_wait_ms: 12_000,
            send_queue_capacity: 16,
            stale_timeout_secs: 30,
            ..BrokerSettings::default()
        };
        let cfg = BrokerConfig::from_settings(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.jwt_secret, "k");
        assert_eq!(cfg.timing.ping_interval, Duration::from_secs(5));
        assert_eq!(cfg.timing.pong_wait, Duration::from_secs(12));
        assert_eq!(cfg.send_queue_capacity, 16);
        assert_eq!(cfg.stale_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_message_size, 512 * 1024);
    }
}
