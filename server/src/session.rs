//! Per-client authoritative avatar state.
//!
//! The store is the sole owner of session records; everything else sees them
//! through lookups. Spawn position and color come from an injected seedable
//! generator so tests can pin the randomness down.

use crate::registry::ClientId;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Color, Vec2, SPAWN_REGION_MAX, SPAWN_REGION_MIN};
use std::collections::BTreeMap;
use std::time::Instant;

/// Authoritative state for one connected client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub position: Vec2,
    pub color: Color,
    /// When the last velocity message was applied (creation time until then).
    pub last_update: Instant,
}

pub struct SessionStore {
    sessions: BTreeMap<ClientId, ClientSession>,
    rng: StdRng,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Store with deterministic spawn randomness.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            sessions: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Creates a session with a randomized spawn position and color.
    pub fn create_session(&mut self, id: ClientId) -> &ClientSession {
        let position = Vec2::new(
            self.rng.gen_range(SPAWN_REGION_MIN..SPAWN_REGION_MAX),
            self.rng.gen_range(SPAWN_REGION_MIN..SPAWN_REGION_MAX),
        );
        let color = Color::new(
            self.rng.gen_range(0.0f32..1.0),
            self.rng.gen_range(0.0f32..1.0),
            self.rng.gen_range(0.0f32..1.0),
        );
        info!(
            "client {} spawned at ({}, {})",
            id, position.x, position.y
        );
        self.sessions.entry(id).or_insert(ClientSession {
            position,
            color,
            last_update: Instant::now(),
        })
    }

    /// Integrates `position += (vx, vy) * dt` with the fixed tick duration.
    /// Returns the new position, or `None` when no session exists for `id`
    /// (for example a stale message arriving after disconnect).
    pub fn apply_velocity(
        &mut self,
        id: ClientId,
        vx: f32,
        vy: f32,
        dt: f32,
    ) -> Option<Vec2> {
        let session = self.sessions.get_mut(&id)?;
        session.position.x += vx * dt;
        session.position.y += vy * dt;
        session.last_update = Instant::now();
        Some(session.position)
    }

    /// Removes the session. No-op when already gone.
    pub fn destroy_session(&mut self, id: ClientId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    /// Sessions ordered by client ID, for catch-up snapshots.
    pub fn all_sessions(&self) -> impl Iterator<Item = (ClientId, &ClientSession)> + '_ {
        self.sessions.iter().map(|(id, session)| (*id, session))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
