//! Broker-side state of one live connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use classos_core::Role;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::Identity;

/// Result of offering a frame to a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The frame is queued for the outbound pump.
    Queued,
    /// The queue is at capacity; the peer is not keeping up.
    Full,
    /// The queue was closed by the hub.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct LastSeen {
    at: Instant,
    wall: DateTime<Utc>,
}

/// One connected admin console or agent.
///
/// The hub enqueues and closes; only the session's outbound pump dequeues.
pub struct Session {
    id: Uuid,
    client_id: String,
    role: Role,
    channel: String,
    queue: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    connected_at: Instant,
    last_seen: Mutex<LastSeen>,
    dropped_frames: AtomicU64,
}

impl Session {
    /// Create a session for `identity` with a bounded outbound queue.
    ///
    /// Returns the receiving end for the outbound pump.
    pub fn new(identity: Identity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let session = Self {
            id: Uuid::now_v7(),
            client_id: identity.client_id,
            role: identity.role,
            channel: identity.channel,
            queue: Mutex::new(Some(tx)),
            connected_at: now,
            last_seen: Mutex::new(LastSeen {
                at: now,
                wall: Utc::now(),
            }),
            dropped_frames: AtomicU64::new(0),
        };
        (Arc::new(session), rx)
    }

    /// Unique per connection, unlike the client id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Admin checker id or agent id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Admin or agent.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Channel this session is registered under.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Offer a frame to the outbound queue without waiting.
    pub fn enqueue(&self, frame: Arc<str>) -> EnqueueOutcome {
        let guard = self.queue.lock();
        let Some(tx) = guard.as_ref() else {
            return EnqueueOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Full
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Close the outbound queue. Frames already queued are still drained.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.queue.lock().take().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Record activity from the peer.
    pub fn touch(&self) {
        *self.last_seen.lock() = LastSeen {
            at: Instant::now(),
            wall: Utc::now(),
        };
    }

    /// Time since the peer was last heard from.
    pub fn idle(&self) -> Duration {
        self.last_seen.lock().at.elapsed()
    }

    /// Wall-clock time the peer was last heard from.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen.lock().wall
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames refused because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("role", &self.role)
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
