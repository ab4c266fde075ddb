//! Channel registry and fan-out.
//!
//! The [`Hub`] owns the mapping from channel name to member sessions. Every
//! mutation, fan-out and introspection read takes the same lock, so
//! register, unregister and broadcast are linearized. Delivery never waits
//! on a peer: a member whose queue is full is evicted on the spot and its
//! pumps wind down once they see the closed queue.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use classos_core::{
    ADMIN_DASHBOARD, AgentPresence, AgentStatusPayload, Envelope, MessageType,
    agent_id_from_channel,
};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{EnqueueOutcome, Session};
use crate::metrics::{HUB_EVICTIONS_TOTAL, HUB_STALE_SWEPT_TOTAL};

/// Point-in-time view of the channel map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    /// Number of non-empty channels.
    pub total_channels: usize,
    /// Member count per channel.
    pub channels: BTreeMap<String, usize>,
}

#[derive(Default)]
struct ChannelMap {
    members: HashMap<String, Vec<Arc<Session>>>,
}

impl ChannelMap {
    fn insert(&mut self, session: Arc<Session>) -> bool {
        let members = self.members.entry(session.channel().to_string()).or_default();
        if members.iter().any(|m| m.id() == session.id()) {
            return false;
        }
        members.push(session);
        true
    }

    /// `Some(emptied)` if the session was a member.
    fn remove(&mut self, session: &Session) -> Option<bool> {
        let members = self.members.get_mut(session.channel())?;
        let pos = members.iter().position(|m| m.id() == session.id())?;
        let _ = members.remove(pos);
        let emptied = members.is_empty();
        if emptied {
            let _ = self.members.remove(session.channel());
        }
        Some(emptied)
    }

    fn deliver_all(
        &self,
        channel: &str,
        frame: &Arc<str>,
        evicted: &mut Vec<Arc<Session>>,
    ) -> usize {
        let Some(members) = self.members.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for member in members {
            if offer(member, frame, evicted) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver_first(&self, channel: &str, frame: &Arc<str>, evicted: &mut Vec<Arc<Session>>) -> bool {
        let Some(members) = self.members.get(channel) else {
            return false;
        };
        members.iter().any(|member| offer(member, frame, evicted))
    }

    fn find(&self, channel: &str, session_id: Uuid) -> Option<&Arc<Session>> {
        self.members.get(channel)?.iter().find(|m| m.id() == session_id)
    }
}

/// Enqueue on one member, marking it for eviction if it cannot take the frame.
fn offer(member: &Arc<Session>, frame: &Arc<str>, evicted: &mut Vec<Arc<Session>>) -> bool {
    match member.enqueue(Arc::clone(frame)) {
        EnqueueOutcome::Queued => true,
        outcome => {
            warn!(
                channel = member.channel(),
                session_id = %member.id(),
                client_id = member.client_id(),
                ?outcome,
                "session cannot accept frames, evicting"
            );
            counter!(HUB_EVICTIONS_TOTAL).increment(1);
            evicted.push(Arc::clone(member));
            false
        }
    }
}

/// Shared handle to the channel registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct Hub {
    channels: Arc<Mutex<ChannelMap>>,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session under its channel, creating the channel if needed.
    ///
    /// Returns `false` if the session is already a member or was closed.
    pub fn register(&self, session: Arc<Session>) -> bool {
        if session.is_closed() {
            return false;
        }
        let mut map = self.channels.lock();
        let added = map.insert(Arc::clone(&session));
        if added {
            info!(
                channel = session.channel(),
                session_id = %session.id(),
                client_id = session.client_id(),
                role = %session.role(),
                members = map.members.get(session.channel()).map_or(0, Vec::len),
                "session registered"
            );
        }
        added
    }

    /// Remove a session, close its queue, drop its channel if now empty.
    ///
    /// Emptying an agent channel notifies the dashboard that the agent went
    /// offline. Returns `false` if the session was not a member.
    pub fn unregister(&self, session: &Session) -> bool {
        let mut map = self.channels.lock();
        unregister_locked(&mut map, session)
    }

    /// Encode once and enqueue on every member of `channel`.
    ///
    /// Returns how many members accepted the frame.
    pub fn broadcast_to_channel(&self, channel: &str, envelope: &Envelope) -> usize {
        match encode(envelope) {
            Some(frame) => self.broadcast_frame(channel, frame),
            None => 0,
        }
    }

    /// [`broadcast_to_channel`](Self::broadcast_to_channel) for an already
    /// encoded frame.
    pub fn broadcast_frame(&self, channel: &str, frame: Arc<str>) -> usize {
        let mut map = self.channels.lock();
        let mut evicted = Vec::new();
        let delivered = map.deliver_all(channel, &frame, &mut evicted);
        drain_evicted(&mut map, evicted);
        debug!(channel, delivered, "broadcast");
        delivered
    }

    /// Deliver to the first member of `channel` that accepts the frame.
    ///
    /// Returns `false` if the channel has no member able to take it.
    pub fn send_to_channel(&self, channel: &str, envelope: &Envelope) -> bool {
        encode(envelope).is_some_and(|frame| self.send_frame_to_channel(channel, frame))
    }

    /// [`send_to_channel`](Self::send_to_channel) for an already encoded frame.
    pub fn send_frame_to_channel(&self, channel: &str, frame: Arc<str>) -> bool {
        let mut map = self.channels.lock();
        let mut evicted = Vec::new();
        let sent = map.deliver_first(channel, &frame, &mut evicted);
        drain_evicted(&mut map, evicted);
        debug!(channel, sent, "targeted send");
        sent
    }

    /// Deliver to one specific session, if it is still a member of `channel`.
    pub fn send_frame_to_session(&self, channel: &str, session_id: Uuid, frame: Arc<str>) -> bool {
        let mut map = self.channels.lock();
        let mut evicted = Vec::new();
        let sent = map
            .find(channel, session_id)
            .is_some_and(|member| offer(member, &frame, &mut evicted));
        drain_evicted(&mut map, evicted);
        sent
    }

    /// Names of all live channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        let map = self.channels.lock();
        let mut names: Vec<String> = map.members.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Members of `channel`, in registration order.
    pub fn channel_clients(&self, channel: &str) -> Vec<Arc<Session>> {
        self.channels
            .lock()
            .members
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Total sessions across all channels.
    pub fn session_count(&self) -> usize {
        self.channels.lock().members.values().map(Vec::len).sum()
    }

    /// Channel map summary for the status endpoint.
    pub fn status(&self) -> HubStatus {
        let map = self.channels.lock();
        let channels: BTreeMap<String, usize> = map
            .members
            .iter()
            .map(|(name, members)| (name.clone(), members.len()))
            .collect();
        HubStatus {
            total_channels: channels.len(),
            channels,
        }
    }

    /// Unregister every session silent for longer than `timeout`.
    ///
    /// Returns how many were removed.
    pub fn cleanup_stale_connections(&self, timeout: Duration) -> usize {
        let mut map = self.channels.lock();
        let stale: Vec<Arc<Session>> = map
            .members
            .values()
            .flatten()
            .filter(|s| s.idle() > timeout)
            .cloned()
            .collect();

        for session in &stale {
            info!(
                channel = session.channel(),
                session_id = %session.id(),
                client_id = session.client_id(),
                idle_secs = session.idle().as_secs(),
                "removing stale session"
            );
            let _ = unregister_locked(&mut map, session);
        }
        if !stale.is_empty() {
            counter!(HUB_STALE_SWEPT_TOTAL).increment(stale.len() as u64);
        }
        stale.len()
    }

    /// Run [`cleanup_stale_connections`](Self::cleanup_stale_connections)
    /// every `timeout / 2` until `cancel` fires.
    pub fn spawn_stale_sweep(&self, timeout: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        let period = (timeout / 2).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            let _ = ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = hub.cleanup_stale_connections(timeout);
                        if removed > 0 {
                            info!(removed, "stale sweep");
                        }
                    }
                }
            }
            debug!("stale sweep stopped");
        })
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("Hub")
            .field("total_channels", &status.total_channels)
            .field("channels", &status.channels)
            .finish()
    }
}

fn encode(envelope: &Envelope) -> Option<Arc<str>> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            warn!(message_type = %envelope.message_type, error = %err, "failed to encode envelope");
            None
        }
    }
}

fn unregister_locked(map: &mut ChannelMap, session: &Session) -> bool {
    let mut evicted = Vec::new();
    let removed = remove_one(map, session, &mut evicted);
    drain_evicted(map, evicted);
    removed
}

fn drain_evicted(map: &mut ChannelMap, mut evicted: Vec<Arc<Session>>) {
    while let Some(session) = evicted.pop() {
        let _ = remove_one(map, &session, &mut evicted);
    }
}

fn remove_one(map: &mut ChannelMap, session: &Session, evicted: &mut Vec<Arc<Session>>) -> bool {
    let _ = session.close();
    let Some(emptied) = map.remove(session) else {
        return false;
    };
    info!(
        channel = session.channel(),
        session_id = %session.id(),
        client_id = session.client_id(),
        channel_removed = emptied,
        "session unregistered"
    );

    if emptied {
        if let Some(agent_id) = agent_id_from_channel(session.channel()) {
            if let Some(frame) = offline_notice(agent_id, session) {
                let _ = map.deliver_all(ADMIN_DASHBOARD, &frame, evicted);
            }
        }
    }
    true
}

fn offline_notice(agent_id: &str, session: &Session) -> Option<Arc<str>> {
    let payload = AgentStatusPayload {
        agent_id: agent_id.to_string(),
        hostname: agent_id.to_string(),
        status: AgentPresence::Offline,
        last_seen: session.last_seen(),
        username: None,
    };
    let envelope = Envelope::new(MessageType::AgentStatus, &payload)
        .ok()?
        .with_agent_id(agent_id);
    encode(&envelope)
}
