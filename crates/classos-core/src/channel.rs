//! Channel naming and connection roles.
//!
//! Every session lives on exactly one channel. Admin consoles share
//! [`ADMIN_DASHBOARD`]; each agent gets its own `agent::<id>` channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// The single channel shared by every admin console.
pub const ADMIN_DASHBOARD: &str = "admin::dashboard";

/// Prefix of per-agent channels.
pub const AGENT_CHANNEL_PREFIX: &str = "agent::";

/// Channel name for one agent.
pub fn agent_channel(agent_id: &str) -> String {
    format!("{AGENT_CHANNEL_PREFIX}{agent_id}")
}

/// Agent id encoded in an `agent::<id>` channel name, if it is one.
pub fn agent_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(AGENT_CHANNEL_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Admin console on the dashboard channel.
    Admin,
    /// Endpoint agent on its own channel.
    Agent,
}

impl Role {
    /// Wire form of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Agent => "agent",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "agent" => Ok(Role::Agent),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn agent_channel_format() {
        assert_eq!(agent_channel("A1"), "agent::A1");
    }

    #[test]
    fn agent_id_roundtrips_through_channel() {
        assert_eq!(agent_id_from_channel(&agent_channel("lab-3")), Some("lab-3"));
    }

    #[test]
    fn dashboard_is_not_an_agent_channel() {
        assert_eq!(agent_id_from_channel(ADMIN_DASHBOARD), None);
        assert_eq!(agent_id_from_channel("agent::"), None);
    }

    #[test]
    fn role_parse_and_display() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("agent".parse::<Role>().unwrap(), Role::Agent);
        assert_eq!(Role::Agent.to_string(), "agent");
        assert_matches!("teacher".parse::<Role>(), Err(ProtocolError::UnknownRole(r)) if r == "teacher");
    }

    #[test]
    fn role_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        let role: Role = serde_json::from_str("\"agent\"").unwrap();
        assert_eq!(role, Role::Agent);
    }
}
