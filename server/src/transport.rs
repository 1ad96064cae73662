//! Transport adapter: connection-oriented datagram delivery over a byte stream.
//!
//! The server loop talks to a [`Transport`] and never to sockets directly.
//! Two implementations live here:
//!
//! - [`TcpTransport`]: the production transport. A listener task queues
//!   accepted peers; each connection gets a reader task (deframes inbound
//!   messages) and a writer task (frames outbound messages). The
//!   reliable-ordered channel maps onto the TCP stream itself; the
//!   unreliable channel maps onto a bounded queue that drops messages on
//!   overflow instead of applying backpressure.
//! - [`MemoryTransport`]: an in-process loopback used by tests and local
//!   experiments, with the same observable semantics.
//!
//! Framing: every logical message is a 4-byte big-endian length followed by
//! that many payload bytes. A declared length over [`MAX_FRAME_LEN`] or past
//! the end of the buffer is an explicit [`FrameError`], never a silent
//! truncation, and kills the offending connection.

use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc as tokio_mpsc;
use tokio::time::{timeout, Duration};

/// Opaque connection handle. Owned by the transport; everything else holds
/// it for lookup only.
pub type ConnId = u64;

/// Largest payload a single frame may declare.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// How many unreliable messages may queue per connection before drops start.
const UNRELIABLE_QUEUE_LEN: usize = 64;

/// Delivery channel for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Ordered, loss-free delivery.
    Reliable,
    /// Best-effort delivery; may be dropped under pressure.
    Unreliable,
}

/// Events surfaced by [`Transport::poll_events`]. New connections are
/// surfaced separately through [`Transport::accept`].
#[derive(Debug)]
pub enum TransportEvent {
    Data(Vec<u8>),
    Disconnect,
}

/// Framing violation on an inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than four bytes available for the length prefix.
    MissingHeader { available: usize },
    /// Declared length exceeds [`MAX_FRAME_LEN`].
    Oversized { declared: usize, max: usize },
    /// Declared length exceeds the bytes actually present.
    Truncated { declared: usize, available: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::MissingHeader { available } => {
                write!(f, "frame header needs 4 bytes, got {}", available)
            }
            FrameError::Oversized { declared, max } => {
                write!(f, "frame declares {} bytes, max is {}", declared, max)
            }
            FrameError::Truncated {
                declared,
                available,
            } => write!(
                f,
                "frame declares {} bytes but only {} are present",
                declared, available
            ),
        }
    }
}

impl std::error::Error for FrameError {}

/// Prefixes `payload` with its 4-byte big-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Extracts the payload of a single frame from `buf`.
pub fn decode_frame(buf: &[u8]) -> Result<&[u8], FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::MissingHeader {
            available: buf.len(),
        });
    }
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            declared,
            max: MAX_FRAME_LEN,
        });
    }
    let available = buf.len() - 4;
    if declared > available {
        return Err(FrameError::Truncated {
            declared,
            available,
        });
    }
    Ok(&buf[4..4 + declared])
}

/// A send could not even be queued for the given connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    UnknownConnection(ConnId),
    ConnectionClosed(ConnId),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownConnection(id) => write!(f, "unknown connection {}", id),
            SendError::ConnectionClosed(id) => write!(f, "connection {} is closed", id),
        }
    }
}

impl std::error::Error for SendError {}

/// Binding the listen port failed. Fatal at startup; the server never enters
/// its listening state.
#[derive(Debug)]
pub struct BindError {
    pub addr: String,
    pub source: io::Error,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to bind {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Black-box datagram transport as seen by the server loop.
///
/// All methods are non-blocking; internal I/O runs on background tasks that
/// publish into queues drained here (pump-then-drain). Sends are
/// fire-and-forget: an `Err` means the message could not be queued, a
/// transmission failure after queuing surfaces as the connection going dead.
pub trait Transport {
    /// Flushes transport-internal bookkeeping. Called once at the start of
    /// every tick, before pruning.
    fn pump(&mut self) {}

    /// Returns one pending new connection, or `None` when there are no more.
    fn accept(&mut self) -> Option<ConnId>;

    /// Drains all pending data/disconnect events.
    fn poll_events(&mut self) -> Vec<(ConnId, TransportEvent)>;

    /// Queues `payload` for delivery on the given channel.
    fn send(&mut self, conn: ConnId, payload: &[u8], channel: Channel) -> Result<(), SendError>;

    /// Liveness signal used by the registry's prune pass.
    fn is_alive(&self, conn: ConnId) -> bool;

    /// Tears down a connection locally. Idempotent.
    fn disconnect(&mut self, conn: ConnId);
}

#[derive(Debug)]
struct TcpPeer {
    reliable_tx: tokio_mpsc::UnboundedSender<Vec<u8>>,
    unreliable_tx: tokio_mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
}

/// Production transport over TCP with length-prefixed framing.
#[derive(Debug)]
pub struct TcpTransport {
    local_addr: SocketAddr,
    accept_rx: tokio_mpsc::UnboundedReceiver<(ConnId, TcpPeer)>,
    event_rx: tokio_mpsc::UnboundedReceiver<(ConnId, TransportEvent)>,
    peers: HashMap<ConnId, TcpPeer>,
}

impl TcpTransport {
    /// Binds the listen address and starts the accept task. A connection
    /// with no inbound traffic for `idle_timeout` is marked dead and pruned
    /// on the next tick.
    pub async fn bind(addr: &str, idle_timeout: Duration) -> Result<Self, BindError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| BindError {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| BindError {
            addr: addr.to_string(),
            source: e,
        })?;

        let (accept_tx, accept_rx) = tokio_mpsc::unbounded_channel();
        let (event_tx, event_rx) = tokio_mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut next_id: ConnId = 1;
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let _ = stream.set_nodelay(true);
                        let id = next_id;
                        next_id += 1;
                        debug!("accepted connection {} from {}", id, peer_addr);
                        let peer = spawn_peer(stream, id, idle_timeout, event_tx.clone());
                        if accept_tx.send((id, peer)).is_err() {
                            // Transport dropped; stop listening.
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_rx,
            event_rx,
            peers: HashMap::new(),
        })
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn spawn_peer(
    stream: TcpStream,
    id: ConnId,
    idle_timeout: Duration,
    event_tx: tokio_mpsc::UnboundedSender<(ConnId, TransportEvent)>,
) -> TcpPeer {
    let (read_half, write_half) = stream.into_split();
    let alive = Arc::new(AtomicBool::new(true));

    let (reliable_tx, reliable_rx) = tokio_mpsc::unbounded_channel::<Vec<u8>>();
    let (unreliable_tx, unreliable_rx) = tokio_mpsc::channel::<Vec<u8>>(UNRELIABLE_QUEUE_LEN);

    tokio::spawn(run_reader(
        read_half,
        id,
        idle_timeout,
        Arc::clone(&alive),
        event_tx,
    ));
    tokio::spawn(run_writer(write_half, id, reliable_rx, unreliable_rx, Arc::clone(&alive)));

    TcpPeer {
        reliable_tx,
        unreliable_tx,
        alive,
    }
}

/// Reads length-prefixed frames until EOF, error, framing violation, or
/// idle timeout, then reports a single disconnect.
async fn run_reader(
    mut read_half: OwnedReadHalf,
    id: ConnId,
    idle_timeout: Duration,
    alive: Arc<AtomicBool>,
    event_tx: tokio_mpsc::UnboundedSender<(ConnId, TransportEvent)>,
) {
    loop {
        let declared = match timeout(idle_timeout, read_half.read_u32()).await {
            Err(_) => {
                debug!("connection {} idle for {:?}, marking dead", id, idle_timeout);
                break;
            }
            Ok(Err(_)) => break,
            Ok(Ok(len)) => len as usize,
        };

        if declared > MAX_FRAME_LEN {
            warn!(
                "connection {}: {}",
                id,
                FrameError::Oversized {
                    declared,
                    max: MAX_FRAME_LEN,
                }
            );
            break;
        }

        let mut payload = vec![0u8; declared];
        match timeout(idle_timeout, read_half.read_exact(&mut payload)).await {
            Err(_) | Ok(Err(_)) => break,
            Ok(Ok(_)) => {}
        }

        if event_tx
            .send((id, TransportEvent::Data(payload)))
            .is_err()
        {
            return;
        }
    }

    alive.store(false, Ordering::SeqCst);
    let _ = event_tx.send((id, TransportEvent::Disconnect));
}

/// Frames and writes queued messages. Reliable messages take priority over
/// unreliable ones when both queues are non-empty.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    id: ConnId,
    mut reliable_rx: tokio_mpsc::UnboundedReceiver<Vec<u8>>,
    mut unreliable_rx: tokio_mpsc::Receiver<Vec<u8>>,
    alive: Arc<AtomicBool>,
) {
    loop {
        let payload = tokio::select! {
            biased;
            msg = reliable_rx.recv() => msg,
            msg = unreliable_rx.recv() => msg,
        };

        let Some(payload) = payload else { break };

        let write = async {
            write_half.write_u32(payload.len() as u32).await?;
            write_half.write_all(&payload).await?;
            write_half.flush().await
        };

        if let Err(e) = write.await {
            debug!("write to connection {} failed: {}", id, e);
            alive.store(false, Ordering::SeqCst);
            break;
        }
    }
}

impl Transport for TcpTransport {
    fn pump(&mut self) {
        // Garbage-collect peer entries whose tasks reported death. The
        // disconnect event for them is already queued (or delivered).
        self.peers.retain(|_, peer| peer.alive.load(Ordering::SeqCst));
    }

    fn accept(&mut self) -> Option<ConnId> {
        match self.accept_rx.try_recv() {
            Ok((id, peer)) => {
                self.peers.insert(id, peer);
                Some(id)
            }
            Err(_) => None,
        }
    }

    fn poll_events(&mut self) -> Vec<(ConnId, TransportEvent)> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn send(&mut self, conn: ConnId, payload: &[u8], channel: Channel) -> Result<(), SendError> {
        let peer = self
            .peers
            .get(&conn)
            .ok_or(SendError::UnknownConnection(conn))?;
        if !peer.alive.load(Ordering::SeqCst) {
            return Err(SendError::ConnectionClosed(conn));
        }
        match channel {
            Channel::Reliable => peer
                .reliable_tx
                .send(payload.to_vec())
                .map_err(|_| SendError::ConnectionClosed(conn)),
            Channel::Unreliable => {
                if peer.unreliable_tx.try_send(payload.to_vec()).is_err() {
                    // Best-effort channel: overflow means the message is lost.
                    debug!("unreliable queue full for connection {}, dropping", conn);
                }
                Ok(())
            }
        }
    }

    fn is_alive(&self, conn: ConnId) -> bool {
        self.peers
            .get(&conn)
            .map(|p| p.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn disconnect(&mut self, conn: ConnId) {
        if let Some(peer) = self.peers.remove(&conn) {
            peer.alive.store(false, Ordering::SeqCst);
            // Dropping the senders ends the writer task, which closes the
            // stream; the reader then sees EOF and finishes on its own.
        }
    }
}

struct MemoryPeer {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<(Channel, Vec<u8>)>,
    alive: Arc<AtomicBool>,
    disconnect_reported: bool,
}

/// In-process loopback transport. Client-to-server messages travel framed so
/// the framing path (including its failure modes) is exercised; the
/// server-to-client direction is a message-boundary-preserving pipe.
#[derive(Default)]
pub struct MemoryTransport {
    next_id: ConnId,
    pending_accepts: VecDeque<ConnId>,
    peers: BTreeMap<ConnId, MemoryPeer>,
}

/// Client half of a [`MemoryTransport`] connection.
pub struct MemoryClient {
    to_server: mpsc::Sender<Vec<u8>>,
    from_server: mpsc::Receiver<(Channel, Vec<u8>)>,
    alive: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new in-process client; the server sees it on the next
    /// `accept` call.
    pub fn connect(&mut self) -> MemoryClient {
        let id = self.next_id;
        self.next_id += 1;

        let (to_server, inbound) = mpsc::channel();
        let (outbound, from_server) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));

        self.peers.insert(
            id,
            MemoryPeer {
                inbound,
                outbound,
                alive: Arc::clone(&alive),
                disconnect_reported: false,
            },
        );
        self.pending_accepts.push_back(id);

        MemoryClient {
            to_server,
            from_server,
            alive,
        }
    }
}

impl Transport for MemoryTransport {
    fn accept(&mut self) -> Option<ConnId> {
        self.pending_accepts.pop_front()
    }

    fn poll_events(&mut self) -> Vec<(ConnId, TransportEvent)> {
        let mut events = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            loop {
                match peer.inbound.try_recv() {
                    Ok(frame) => match decode_frame(&frame) {
                        Ok(payload) => {
                            events.push((*id, TransportEvent::Data(payload.to_vec())))
                        }
                        Err(e) => {
                            warn!("connection {}: {}", id, e);
                            peer.alive.store(false, Ordering::SeqCst);
                            break;
                        }
                    },
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        peer.alive.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }

            if !peer.alive.load(Ordering::SeqCst) && !peer.disconnect_reported {
                peer.disconnect_reported = true;
                events.push((*id, TransportEvent::Disconnect));
            }
        }
        events
    }

    fn send(&mut self, conn: ConnId, payload: &[u8], channel: Channel) -> Result<(), SendError> {
        let peer = self
            .peers
            .get(&conn)
            .ok_or(SendError::UnknownConnection(conn))?;
        if !peer.alive.load(Ordering::SeqCst) {
            return Err(SendError::ConnectionClosed(conn));
        }
        peer.outbound
            .send((channel, payload.to_vec()))
            .map_err(|_| SendError::ConnectionClosed(conn))
    }

    fn is_alive(&self, conn: ConnId) -> bool {
        self.peers
            .get(&conn)
            .map(|p| p.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn disconnect(&mut self, conn: ConnId) {
        if let Some(peer) = self.peers.remove(&conn) {
            peer.alive.store(false, Ordering::SeqCst);
        }
    }
}

impl MemoryClient {
    /// Sends a payload to the server, framed.
    pub fn send(&self, payload: &[u8]) {
        let _ = self.to_server.send(encode_frame(payload));
    }

    /// Sends raw pre-framed bytes; lets tests exercise framing violations.
    pub fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.to_server.send(frame);
    }

    /// Receives one pending message from the server, if any.
    pub fn try_recv(&self) -> Option<(Channel, Vec<u8>)> {
        self.from_server.try_recv().ok()
    }

    /// Drains every pending message from the server.
    pub fn drain(&self) -> Vec<(Channel, Vec<u8>)> {
        let mut messages = Vec::new();
        while let Some(msg) = self.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Simulates the peer going away; the server's liveness signal flips on
    /// its next poll.
    pub fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Whether the server still holds this connection open.
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
