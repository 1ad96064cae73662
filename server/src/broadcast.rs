//! Decides when state changes go out and to whom.
//!
//! Three triggers exist: connect (catch-up plus announcement), position
//! update (throttled), and disconnect (removal notice). The policy only
//! selects messages and recipients; the server loop owns the actual sends
//! and takes its recipient snapshots before an event is processed.

use crate::registry::ClientId;
use crate::session::SessionStore;
use shared::ServerMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct BroadcastPolicy {
    /// Whether an update broadcast includes the client that sent the
    /// velocity. Default on: the authoritative echo corrects local drift.
    include_originator: bool,
    /// Minimum interval between update broadcasts per client. Velocity is
    /// integrated on every message regardless; only the wire send is
    /// throttled.
    min_update_interval: Duration,
    last_broadcast: HashMap<ClientId, Instant>,
}

impl BroadcastPolicy {
    pub fn new(include_originator: bool, min_update_interval: Duration) -> Self {
        Self {
            include_originator,
            min_update_interval,
            last_broadcast: HashMap::new(),
        }
    }

    /// One SpawnAvatar per pre-existing session, for the new client's
    /// catch-up. The new client's own session is excluded.
    pub fn catch_up_messages(
        &self,
        new_client: ClientId,
        sessions: &SessionStore,
    ) -> Vec<ServerMessage> {
        sessions
            .all_sessions()
            .filter(|(id, _)| *id != new_client)
            .map(|(id, session)| ServerMessage::SpawnAvatar {
                id,
                x: session.position.x,
                y: session.position.y,
                r: session.color.r,
                g: session.color.g,
                b: session.color.b,
            })
            .collect()
    }

    /// Recipients of the announcement that `new_client` joined.
    pub fn announce_targets(&self, new_client: ClientId, snapshot: &[ClientId]) -> Vec<ClientId> {
        snapshot
            .iter()
            .copied()
            .filter(|id| *id != new_client)
            .collect()
    }

    /// Recipients of an update broadcast originated by `originator`.
    pub fn update_targets(&self, originator: ClientId, snapshot: &[ClientId]) -> Vec<ClientId> {
        snapshot
            .iter()
            .copied()
            .filter(|id| self.include_originator || *id != originator)
            .collect()
    }

    /// Whether an update broadcast for `id` may go out at `now`. Records the
    /// broadcast time when it may. Suppressed broadcasts drop only the wire
    /// traffic, never the integration that preceded this call.
    pub fn allow_update_broadcast(&mut self, id: ClientId, now: Instant) -> bool {
        if let Some(last) = self.last_broadcast.get(&id) {
            if now.duration_since(*last) < self.min_update_interval {
                return false;
            }
        }
        self.last_broadcast.insert(id, now);
        true
    }

    /// Clears throttle state on disconnect so a reused ID starts fresh.
    pub fn forget(&mut self, id: ClientId) {
        self.last_broadcast.remove(&id);
    }
}
