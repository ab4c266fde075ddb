//! Correlates `command_request`s with the admin session that sent them, so
//! the matching `command_response` goes back to that console only.

use std::collections::{HashMap, hash_map};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Entry {
    session_id: Uuid,
    expires_at: Instant,
}

/// `request_id` → originating admin session, with expiry.
#[derive(Debug)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl PendingRequests {
    /// Table whose entries live `default_ttl` unless told otherwise.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Remember that `session_id` is waiting on `request_id`.
    ///
    /// `ttl` of `None` uses the table default, as does a `ttl` too large to
    /// represent as a deadline. Expired entries are purged on the way. A
    /// live entry owned by another session is kept and `false` returned.
    pub fn insert(
        &self,
        request_id: impl Into<String>,
        session_id: Uuid,
        ttl: Option<Duration>,
    ) -> bool {
        let now = Instant::now();
        let fallback = now + self.default_ttl;
        let expires_at = ttl.map_or(fallback, |ttl| now.checked_add(ttl).unwrap_or(fallback));

        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at > now);
        match entries.entry(request_id.into()) {
            hash_map::Entry::Occupied(held) if held.get().session_id != session_id => false,
            hash_map::Entry::Occupied(mut held) => {
                let _ = held.insert(Entry {
                    session_id,
                    expires_at,
                });
                true
            }
            hash_map::Entry::Vacant(slot) => {
                let _ = slot.insert(Entry {
                    session_id,
                    expires_at,
                });
                true
            }
        }
    }

    /// Claim the waiting session for `request_id`. Each id resolves once.
    pub fn take(&self, request_id: &str) -> Option<Uuid> {
        let entry = self.entries.lock().remove(request_id)?;
        (entry.expires_at > Instant::now()).then_some(entry.session_id)
    }

    /// Drop `request_id` without resolving it, if `session_id` owns it.
    pub fn forget(&self, request_id: &str, session_id: Uuid) {
        let mut entries = self.entries.lock();
        if entries.get(request_id).is_some_and(|e| e.session_id == session_id) {
            let _ = entries.remove(request_id);
        }
    }

    /// Number of entries, expired ones included until the next purge.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
