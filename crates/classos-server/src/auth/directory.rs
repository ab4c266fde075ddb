//! Device directory: the collaborator that knows which agents exist.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Lookup of registered devices, consulted after a device token is parsed.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Whether `agent_id` may connect.
    async fn is_known(&self, agent_id: &str) -> bool;
}

/// Accepts every agent id.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl DeviceDirectory for OpenDirectory {
    async fn is_known(&self, _agent_id: &str) -> bool {
        true
    }
}

/// Fixed allow-list of agent ids, editable at runtime.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    known: RwLock<HashSet<String>>,
}

impl StaticDirectory {
    /// Directory containing `ids`.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Register a device. Returns `false` if it was already known.
    pub fn add(&self, agent_id: impl Into<String>) -> bool {
        self.known.write().insert(agent_id.into())
    }

    /// Forget a device. Returns `false` if it was not known.
    pub fn remove(&self, agent_id: &str) -> bool {
        self.known.write().remove(agent_id)
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn is_known(&self, agent_id: &str) -> bool {
        self.known.read().contains(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_directory_knows_everyone() {
        assert!(OpenDirectory.is_known("anything").await);
    }

    #[tokio::test]
    async fn static_directory_add_remove() {
        let dir = StaticDirectory::new(["A1"]);
        assert!(dir.is_known("A1").await);
        assert!(!dir.is_known("A2").await);
        assert!(dir.add("A2"));
        assert!(!dir.add("A2"));
        assert!(dir.is_known("A2").await);
        assert!(dir.remove("A1"));
        assert!(!dir.is_known("A1").await);
    }
}
