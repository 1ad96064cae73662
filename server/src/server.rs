//! The tick loop: accept, prune, dispatch, broadcast.
//!
//! All registry, session, and policy mutation happens here on one logical
//! thread; the transport's background I/O publishes into queues that each
//! tick drains (pump-then-drain). A tick runs to completion; shutdown is
//! observed between ticks, never inside one.

use crate::broadcast::BroadcastPolicy;
use crate::error::ServerError;
use crate::registry::{ClientId, ConnectionRegistry};
use crate::session::SessionStore;
use crate::transport::{Channel, ConnId, Transport, TransportEvent};
use log::{debug, info, warn};
use shared::{ClientMessage, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Lifecycle of the server loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Bound,
    Listening,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ticks per second. The fixed integration dt is `1 / tick_rate`.
    pub tick_rate: u32,
    /// Whether update broadcasts include the originating client.
    pub include_originator: bool,
    /// Minimum interval between update broadcasts per client.
    pub min_update_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 50,
            include_originator: true,
            min_update_interval: Duration::from_millis(100),
        }
    }
}

/// Flips the running server into its shutdown path at the next tick
/// boundary. Cheap to clone into signal handlers or other tasks.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Authoritative state-sync server over any [`Transport`].
///
/// Owns every piece of mutable state: connection registry, session store,
/// and broadcast policy. No globals; independent instances coexist freely,
/// which is how the tests run several servers in one process.
pub struct Server<T: Transport> {
    transport: T,
    registry: ConnectionRegistry,
    sessions: SessionStore,
    policy: BroadcastPolicy,
    state: ServerState,
    shutdown: Arc<AtomicBool>,
    tick_duration: Duration,
    tick_dt: f32,
    tick: u64,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: ServerConfig) -> Self {
        Self::with_sessions(transport, config, SessionStore::new())
    }

    /// Builds a server around an injected session store, e.g. a seeded one.
    pub fn with_sessions(transport: T, config: ServerConfig, sessions: SessionStore) -> Self {
        let tick_rate = config.tick_rate.max(1);
        Self {
            transport,
            registry: ConnectionRegistry::new(),
            sessions,
            policy: BroadcastPolicy::new(config.include_originator, config.min_update_interval),
            state: ServerState::Idle,
            shutdown: Arc::new(AtomicBool::new(false)),
            tick_duration: Duration::from_secs_f32(1.0 / tick_rate as f32),
            tick_dt: 1.0 / tick_rate as f32,
            tick: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Direct access to the transport, used by tests to drive the in-memory
    /// client side.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Drives ticks at the configured rate until the shutdown handle fires.
    pub async fn run(&mut self) {
        // The transport arrives bound.
        self.state = ServerState::Bound;
        let mut interval = tokio::time::interval(self.tick_duration);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.state = ServerState::Listening;
        info!(
            "server listening, tick rate {:.0}Hz",
            1.0 / self.tick_dt
        );
        interval.tick().await; // first tick fires immediately

        self.state = ServerState::Running;
        while !self.shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick();
        }

        self.state = ServerState::ShuttingDown;
        info!("server shutting down after {} ticks", self.tick);
        self.close_all();
        self.state = ServerState::Stopped;
    }

    /// One full tick: pump, prune, accept, dispatch.
    pub fn tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);

        // 1. Let the transport flush its internal queues.
        self.transport.pump();

        // 2. Prune connections the transport no longer considers live, before
        //    any new ones are admitted. Keeps registry and sessions
        //    consistent even when a disconnect event was missed or reordered.
        for (client_id, conn) in self.registry.entries() {
            if !self.transport.is_alive(conn) {
                self.teardown(client_id);
            }
        }

        // 3. Admit every pending connection.
        while let Some(conn) = self.transport.accept() {
            self.handle_connect(conn);
        }

        // 4. Drain and dispatch events. A failure affects only the message or
        //    recipient it belongs to.
        for (conn, event) in self.transport.poll_events() {
            match event {
                TransportEvent::Data(payload) => {
                    if let Err(e) = self.handle_data(conn, &payload) {
                        warn!("dropping message from connection {}: {}", conn, e);
                    }
                }
                TransportEvent::Disconnect => {
                    if let Some(client_id) = self.registry.client_of(conn) {
                        self.teardown(client_id);
                    }
                }
            }
        }
    }

    fn handle_connect(&mut self, conn: ConnId) {
        // Snapshot the peers that existed before this event; the announce
        // pass below iterates it, not the live registry.
        let existing = self.registry.client_ids();

        let client_id = self.registry.accept(conn);
        let session = self.sessions.create_session(client_id);
        let (position, color) = (session.position, session.color);
        info!("client {} connected on connection {}", client_id, conn);

        // Catch the new client up on everyone who was already here.
        for msg in self.policy.catch_up_messages(client_id, &self.sessions) {
            if let Err(e) = self.send_to(client_id, &msg) {
                warn!("catch-up send to client {} failed: {}", client_id, e);
            }
        }

        // Tell everyone who was already here about the new client.
        let announcement = ServerMessage::SpawnAvatar {
            id: client_id,
            x: position.x,
            y: position.y,
            r: color.r,
            g: color.g,
            b: color.b,
        };
        let targets = self.policy.announce_targets(client_id, &existing);
        self.broadcast_to(&targets, &announcement);
    }

    fn handle_data(&mut self, conn: ConnId, payload: &[u8]) -> Result<(), ServerError> {
        let client_id = self
            .registry
            .client_of(conn)
            .ok_or(ServerError::UnknownClient(conn))?;
        let message = ClientMessage::decode(payload)?;
        debug!("client {} sent {:?}", client_id, message);

        match message {
            ClientMessage::UpdatePosition { vx, vy } => {
                // Integration always happens; the broadcast below may not.
                let position = self
                    .sessions
                    .apply_velocity(client_id, vx, vy, self.tick_dt)
                    .ok_or(ServerError::UnknownClient(conn))?;

                if self.policy.allow_update_broadcast(client_id, Instant::now()) {
                    let snapshot = self.registry.client_ids();
                    let targets = self.policy.update_targets(client_id, &snapshot);
                    let update = ServerMessage::UpdatePosition {
                        id: client_id,
                        x: position.x,
                        y: position.y,
                    };
                    self.broadcast_to(&targets, &update);
                }
            }
        }
        Ok(())
    }

    /// Removes a client everywhere, then tells the survivors. Removal comes
    /// first so a racing late message for this ID fails cleanly. Idempotent:
    /// a second call for the same ID finds nothing and sends nothing.
    fn teardown(&mut self, client_id: ClientId) {
        let Some(conn) = self.registry.remove_by_id(client_id) else {
            return;
        };
        self.sessions.destroy_session(client_id);
        self.policy.forget(client_id);
        self.transport.disconnect(conn);
        info!("client {} disconnected", client_id);

        let remaining = self.registry.client_ids();
        self.broadcast_to(&remaining, &ServerMessage::RemoveAvatar { id: client_id });
    }

    /// Closes every remaining connection so peers observe an orderly
    /// disconnect instead of an idle timeout. Runs once, during shutdown.
    fn close_all(&mut self) {
        let entries = self.registry.entries();
        if !entries.is_empty() {
            info!("closing {} client connections", entries.len());
        }
        for (client_id, conn) in entries {
            self.registry.remove_by_id(client_id);
            self.sessions.destroy_session(client_id);
            self.policy.forget(client_id);
            self.transport.disconnect(conn);
        }
    }

    fn send_to(&mut self, client_id: ClientId, message: &ServerMessage) -> Result<(), ServerError> {
        let Some(conn) = self.registry.connection_of(client_id) else {
            debug!("client {} vanished before send", client_id);
            return Ok(());
        };
        self.transport.send(conn, &message.encode(), Channel::Reliable)?;
        Ok(())
    }

    /// Sends to each target independently; one bad recipient never aborts
    /// the rest of the broadcast.
    fn broadcast_to(&mut self, targets: &[ClientId], message: &ServerMessage) {
        for &client_id in targets {
            if let Err(e) = self.send_to(client_id, message) {
                warn!("send to client {} failed: {}", client_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn test_server() -> Server<MemoryTransport> {
        Server::with_sessions(
            MemoryTransport::new(),
            ServerConfig::default(),
            SessionStore::with_seed(11),
        )
    }

    #[test]
    fn new_server_is_idle() {
        let server = test_server();
        assert_eq!(server.state(), ServerState::Idle);
        assert!(server.registry().is_empty());
        assert!(server.sessions().is_empty());
    }

    #[test]
    fn connect_creates_registry_entry_and_session() {
        let mut server = test_server();
        let _client = server.transport_mut().connect();

        server.tick();

        assert_eq!(server.registry().len(), 1);
        assert_eq!(server.sessions().len(), 1);
        assert!(server.sessions().get(0).is_some());
    }

    #[test]
    fn prune_runs_before_accept() {
        let mut server = test_server();
        let first = server.transport_mut().connect();
        server.tick();
        assert_eq!(server.registry().client_ids(), vec![0]);

        // The first client dies and a new one arrives before the next tick;
        // the vacated ID 0 must go to the newcomer within that same tick.
        first.disconnect();
        let _second = server.transport_mut().connect();
        server.tick();

        assert_eq!(server.registry().client_ids(), vec![0]);
        assert_eq!(server.sessions().len(), 1);
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut server = test_server();
        let a = server.transport_mut().connect();
        let b = server.transport_mut().connect();
        server.tick();
        b.drain();

        a.disconnect();
        // Duplicate disconnect signals across two ticks.
        server.tick();
        server.tick();

        let removals = b
            .drain()
            .into_iter()
            .filter(|(_, payload)| {
                matches!(
                    ServerMessage::decode(payload),
                    Ok(ServerMessage::RemoveAvatar { id: 0 })
                )
            })
            .count();
        assert_eq!(removals, 1);
        assert!(server.sessions().get(0).is_none());
    }

    #[test]
    fn simultaneous_disconnects_do_not_abort_teardown() {
        let mut server = test_server();
        let a = server.transport_mut().connect();
        let b = server.transport_mut().connect();
        server.tick();

        // Both vanish before the next tick. Tearing down the first client
        // broadcasts its removal toward the second, whose connection is
        // already dead; that send failure must not stop the second teardown.
        a.disconnect();
        b.disconnect();
        server.tick();

        assert!(server.registry().is_empty());
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn run_reaches_stopped_after_shutdown() {
        let mut server = test_server();
        let handle = server.shutdown_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.shutdown();
        });

        server.run().await;
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_closes_remaining_connections() {
        let mut server = test_server();
        let client = server.transport_mut().connect();
        server.tick();
        assert!(client.is_connected());

        let handle = server.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.shutdown();
        });
        server.run().await;

        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.registry().is_empty());
        assert!(server.sessions().is_empty());
        assert!(!client.is_connected());
    }
}
