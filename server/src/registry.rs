//! Bidirectional mapping between transport connections and client IDs.
//!
//! The registry owns ID allocation and nothing else: connection teardown is
//! the transport's job, session state is the session store's. IDs are
//! allocated first-fit (lowest free integer), so an ID freed by a disconnect
//! is handed to the next client that connects.
//!
//! Invariant: at any instant the mapping is bijective. Both insertion paths
//! go through [`ConnectionRegistry::accept`] and both removal paths clear
//! both directions, so the two maps cannot drift apart.

use crate::transport::ConnId;
use std::collections::HashMap;

/// Stable integer identity of a connected client.
pub type ClientId = u32;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    id_to_conn: HashMap<ClientId, ConnId>,
    conn_to_id: HashMap<ConnId, ClientId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns the lowest free client ID.
    pub fn accept(&mut self, conn: ConnId) -> ClientId {
        let mut id: ClientId = 0;
        while self.id_to_conn.contains_key(&id) {
            id += 1;
        }
        self.id_to_conn.insert(id, conn);
        self.conn_to_id.insert(conn, id);
        id
    }

    /// Removes by client ID; returns the connection if one was registered.
    /// No-op when the ID is absent.
    pub fn remove_by_id(&mut self, id: ClientId) -> Option<ConnId> {
        let conn = self.id_to_conn.remove(&id)?;
        self.conn_to_id.remove(&conn);
        Some(conn)
    }

    /// Removes by connection; returns the client ID if one was registered.
    /// No-op when the connection is absent.
    pub fn remove_by_conn(&mut self, conn: ConnId) -> Option<ClientId> {
        let id = self.conn_to_id.remove(&conn)?;
        self.id_to_conn.remove(&id);
        Some(id)
    }

    pub fn client_of(&self, conn: ConnId) -> Option<ClientId> {
        self.conn_to_id.get(&conn).copied()
    }

    pub fn connection_of(&self, id: ClientId) -> Option<ConnId> {
        self.id_to_conn.get(&id).copied()
    }

    /// Snapshot of connected client IDs, sorted. Broadcast passes iterate
    /// this snapshot, never the live maps, so mutations during connect or
    /// disconnect handling cannot change who a pass sends to.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.id_to_conn.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of (client, connection) pairs, sorted by client ID. Used by
    /// the tick's prune pass.
    pub fn entries(&self) -> Vec<(ClientId, ConnId)> {
        let mut entries: Vec<(ClientId, ConnId)> = self
            .id_to_conn
            .iter()
            .map(|(id, conn)| (*id, *conn))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    pub fn len(&self) -> usize {
        self.id_to_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_conn.is_empty()
    }
}
