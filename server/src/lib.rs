//! # Avatar State-Sync Server Library
//!
//! Authoritative server for a small real-time multiplayer scene: every
//! connected client owns one avatar (position and color), sends velocity
//! deltas, and receives authoritative position updates for everyone.
//!
//! ## Architecture
//!
//! A single-threaded cooperative tick loop owns all mutable state, so the
//! connection registry and session store need no locks. The transport layer
//! runs its I/O on background tasks and publishes completed events into
//! queues; each tick pumps the transport, prunes dead connections, admits
//! new ones, then drains and dispatches events.
//!
//! ## Module Organization
//!
//! - [`transport`]: black-box datagram transport contract plus the TCP and
//!   in-memory implementations, with length-prefixed framing and two
//!   delivery channels (reliable-ordered, unreliable-unordered).
//! - [`registry`]: bijective connection/client-ID mapping with first-fit
//!   ID allocation.
//! - [`session`]: per-client avatar state, randomized spawns from an
//!   injectable seedable generator.
//! - [`broadcast`]: when and to whom state changes are sent. Catch-up on
//!   connect, throttled position updates, removal notices.
//! - [`server`]: the tick loop and server lifecycle.
//! - [`error`]: the error taxonomy. Only bind failure is fatal.
//!
//! ## Failure Philosophy
//!
//! Steady-state failures are isolated: a malformed message is dropped, a
//! failed send degrades delivery to that recipient only, a dead connection
//! is pruned at the next tick. Availability wins over strict consistency.

pub mod broadcast;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use error::ServerError;
pub use registry::ClientId;
pub use server::{Server, ServerConfig, ServerState, ShutdownHandle};
pub use session::SessionStore;
pub use transport::{
    Channel, ConnId, MemoryClient, MemoryTransport, TcpTransport, Transport, TransportEvent,
};
