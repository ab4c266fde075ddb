//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClassosSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CLASSOS_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ClassosSettings;

/// Resolve the path to the settings file (`~/.classos/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".classos").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClassosSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged result
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClassosSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<ClassosSettings> {
    let defaults = serde_json::to_value(ClassosSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CLASSOS_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut ClassosSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall inside their range; invalid values are
/// ignored with a warning and the file/default value is kept.
pub fn apply_overrides_from<F>(settings: &mut ClassosSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Broker ──────────────────────────────────────────────────────
    let b = &mut settings.broker;
    if let Some(v) = env.string("CLASSOS_HOST") {
        b.host = v;
    }
    if let Some(v) = env.u16("CLASSOS_PORT", 1, 65535) {
        b.port = v;
    }
    if let Some(v) = env.string("CLASSOS_JWT_SECRET") {
        b.jwt_secret = v;
    }
    if let Some(v) = env.u64("CLASSOS_WRITE_WAIT_MS", 100, 600_000) {
        b.write_wait_ms = v;
    }
    if let Some(v) = env.u64("CLASSOS_PONG_WAIT_MS", 1000, 3_600_000) {
        b.pong_wait_ms = v;
    }
    if let Some(v) = env.u64("CLASSOS_PING_INTERVAL_MS", 500, 3_600_000) {
        b.ping_interval_ms = v;
    }
    if let Some(v) = env.usize("CLASSOS_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        b.max_message_size = v;
    }
    if let Some(v) = env.usize("CLASSOS_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        b.send_queue_capacity = v;
    }
    if let Some(v) = env.u64("CLASSOS_STALE_TIMEOUT_SECS", 1, 86_400) {
        b.stale_timeout_secs = v;
    }
    if let Some(v) = env.u64("CLASSOS_PENDING_REQUEST_TTL_SECS", 1, 86_400) {
        b.pending_request_ttl_secs = v;
    }
    if let Some(v) = env.string("CLASSOS_LOG_LEVEL") {
        b.log_level = v;
    }
    if let Some(v) = env.string("CLASSOS_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => b.log_format = format,
            Err(err) => warn!(key = "CLASSOS_LOG_FORMAT", value = %v, %err, "ignoring env var"),
        }
    }

    // ── Agent ───────────────────────────────────────────────────────
    let a = &mut settings.agent;
    if let Some(v) = env.string("CLASSOS_SERVER_URL") {
        a.server_url = v;
    }
    if let Some(v) = env.string("CLASSOS_DEVICE_TOKEN") {
        a.device_token = v;
    }
    if let Some(v) = env.u64("CLASSOS_HEARTBEAT_INTERVAL_MS", 1000, 3_600_000) {
        a.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("CLASSOS_RECONNECT_BASE_DELAY_MS", 10, 600_000) {
        a.reconnect_base_delay_ms = v;
    }
    if let Some(v) = env.u64("CLASSOS_RECONNECT_MAX_DELAY_MS", 10, 3_600_000) {
        a.reconnect_max_delay_ms = v;
    }
    if let Some(v) = env.u64("CLASSOS_WRITE_TIMEOUT_MS", 100, 600_000) {
        a.write_timeout_ms = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn ranged<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.ranged(name, |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.ranged(name, |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.ranged(name, |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
