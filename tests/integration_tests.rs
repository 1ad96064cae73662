//! Integration tests for the avatar state-sync server.
//!
//! These drive a full server through its public tick API over the in-memory
//! transport, plus one real-socket exchange over TCP.

use assert_approx_eq::assert_approx_eq;
use server::transport::MemoryClient;
use server::{Channel, MemoryTransport, Server, ServerConfig, ServerState, SessionStore, TcpTransport};
use shared::ServerMessage;
use std::time::Duration;

fn make_server(update_interval_ms: u64, include_originator: bool) -> Server<MemoryTransport> {
    let config = ServerConfig {
        tick_rate: 50, // dt = 0.02
        include_originator,
        min_update_interval: Duration::from_millis(update_interval_ms),
    };
    Server::with_sessions(MemoryTransport::new(), config, SessionStore::with_seed(1234))
}

fn received(client: &MemoryClient) -> Vec<ServerMessage> {
    client
        .drain()
        .iter()
        .map(|(_, payload)| ServerMessage::decode(payload).expect("server sent malformed message"))
        .collect()
}

/// CONNECT / CATCH-UP TESTS
mod connect_tests {
    use super::*;

    /// C connecting after A and B gets exactly their two avatars (not its
    /// own); A and B each get exactly one announcement for C.
    #[test]
    fn catch_up_and_announcement_counts() {
        let mut server = make_server(0, true);

        let a = server.transport_mut().connect();
        server.tick();
        // First client: nobody to catch up on, nobody to announce to.
        assert!(received(&a).is_empty());

        let b = server.transport_mut().connect();
        server.tick();
        let to_a = received(&a);
        assert!(matches!(to_a[..], [ServerMessage::SpawnAvatar { id: 1, .. }]));
        let to_b = received(&b);
        assert!(matches!(to_b[..], [ServerMessage::SpawnAvatar { id: 0, .. }]));

        let c = server.transport_mut().connect();
        server.tick();

        let to_c = received(&c);
        assert_eq!(to_c.len(), 2);
        let mut ids: Vec<u32> = to_c
            .iter()
            .map(|m| match m {
                ServerMessage::SpawnAvatar { id, .. } => *id,
                other => panic!("unexpected catch-up message: {:?}", other),
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);

        for client in [&a, &b] {
            let msgs = received(client);
            assert!(matches!(msgs[..], [ServerMessage::SpawnAvatar { id: 2, .. }]));
        }
    }

    /// Avatar lifecycle traffic rides the reliable-ordered channel.
    #[test]
    fn server_messages_use_reliable_channel() {
        let mut server = make_server(0, true);
        let a = server.transport_mut().connect();
        server.tick();
        let _b = server.transport_mut().connect();
        server.tick();

        for (channel, _) in a.drain() {
            assert_eq!(channel, Channel::Reliable);
        }
    }

    /// Catch-up announces the same position the session store holds.
    #[test]
    fn catch_up_positions_match_sessions() {
        let mut server = make_server(0, true);
        let _a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();

        let spawn_a = server.sessions().get(0).unwrap().position;
        match received(&b)[..] {
            [ServerMessage::SpawnAvatar { id: 0, x, y, .. }] => {
                assert_approx_eq!(x, spawn_a.x);
                assert_approx_eq!(y, spawn_a.y);
            }
            ref other => panic!("unexpected catch-up: {:?}", other),
        }
    }
}

/// POSITION UPDATE TESTS
mod update_tests {
    use super::*;

    /// A velocity message moves the session by v * dt (dt fixed at 0.02)
    /// and the new position is broadcast to every client, originator
    /// included by default.
    #[test]
    fn velocity_integrates_and_broadcasts() {
        let mut server = make_server(0, true);
        let a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();

        // A learns B's spawn position from the announcement.
        let (bx, by) = match received(&a)[..] {
            [ServerMessage::SpawnAvatar { id: 1, x, y, .. }] => (x, y),
            ref other => panic!("unexpected announcement: {:?}", other),
        };
        b.drain();

        b.send(b"1,1.0,0.0");
        server.tick();

        let expected_x = bx + 1.0 * 0.02;
        for client in [&a, &b] {
            match received(client)[..] {
                [ServerMessage::UpdatePosition { id: 1, x, y }] => {
                    assert_approx_eq!(x, expected_x);
                    assert_approx_eq!(y, by);
                }
                ref other => panic!("unexpected update: {:?}", other),
            }
        }

        let session = server.sessions().get(1).unwrap();
        assert_approx_eq!(session.position.x, expected_x);
        assert_approx_eq!(session.position.y, by);
    }

    /// With originator inclusion off, everyone but the sender is updated.
    #[test]
    fn originator_can_be_excluded() {
        let mut server = make_server(0, false);
        let a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();
        a.drain();
        b.drain();

        b.send(b"1,1.0,0.0");
        server.tick();

        assert_eq!(received(&a).len(), 1);
        assert!(received(&b).is_empty());
    }

    /// Throttled updates still integrate; only the wire traffic is skipped.
    #[test]
    fn throttling_skips_broadcast_but_not_integration() {
        let mut server = make_server(60_000, true);
        let a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();
        a.drain();
        b.drain();

        let start = server.sessions().get(1).unwrap().position;

        b.send(b"1,1.0,0.0");
        server.tick();
        // First update inside the window broadcasts.
        assert_eq!(received(&a).len(), 1);
        assert_eq!(received(&b).len(), 1);

        b.send(b"1,1.0,0.0");
        server.tick();
        b.send(b"1,1.0,0.0");
        server.tick();
        // Follow-ups are suppressed on the wire...
        assert!(received(&a).is_empty());
        assert!(received(&b).is_empty());

        // ...but every velocity message was integrated.
        let pos = server.sessions().get(1).unwrap().position;
        assert_approx_eq!(pos.x, start.x + 3.0 * 0.02);
        assert_approx_eq!(pos.y, start.y);
    }

    /// A malformed message is dropped without touching any session or
    /// stopping the server from handling the next valid message.
    #[test]
    fn malformed_message_is_isolated() {
        let mut server = make_server(0, true);
        let a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();
        a.drain();
        b.drain();

        let before_a = server.sessions().get(0).unwrap().position;
        let before_b = server.sessions().get(1).unwrap().position;

        a.send(b"1,abc,0.0"); // non-numeric field
        a.send(b"7,1.0"); // unknown signifier
        server.tick();

        assert!(received(&a).is_empty());
        assert!(received(&b).is_empty());
        assert_eq!(server.sessions().get(0).unwrap().position, before_a);
        assert_eq!(server.sessions().get(1).unwrap().position, before_b);

        // The connection is still healthy afterwards.
        a.send(b"1,0.0,1.0");
        server.tick();
        assert_eq!(received(&b).len(), 1);
    }
}

/// DISCONNECT TESTS
mod disconnect_tests {
    use super::*;

    /// Every survivor gets exactly one RemoveAvatar; a stale update from the
    /// gone client is dropped without a broadcast or a crash.
    #[test]
    fn disconnect_broadcast_and_stale_message() {
        let mut server = make_server(0, true);
        let a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();
        let c = server.transport_mut().connect();
        server.tick();
        a.drain();
        b.drain();
        c.drain();

        // C sends one last update and vanishes before the next tick. The
        // prune pass runs before event dispatch, so the update is stale by
        // the time it is seen.
        c.send(b"1,1.0,0.0");
        c.disconnect();
        server.tick();

        for client in [&a, &b] {
            let msgs = received(client);
            assert!(matches!(msgs[..], [ServerMessage::RemoveAvatar { id: 2 }]));
        }
        assert!(server.sessions().get(2).is_none());
        assert_eq!(server.registry().client_ids(), vec![0, 1]);

        // Nothing further trickles out on later ticks.
        server.tick();
        assert!(received(&a).is_empty());
        assert!(received(&b).is_empty());
    }

    /// Duplicate disconnect signals collapse to a single teardown.
    #[test]
    fn duplicate_disconnect_is_idempotent() {
        let mut server = make_server(0, true);
        let a = server.transport_mut().connect();
        server.tick();
        let b = server.transport_mut().connect();
        server.tick();
        a.drain();
        b.drain();

        a.disconnect();
        server.tick();
        server.tick();
        server.tick();

        let removals = received(&b)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::RemoveAvatar { id: 0 }))
            .count();
        assert_eq!(removals, 1);
    }

    /// The ID vacated by a disconnect goes to the next connection, and the
    /// survivors hear about the newcomer under that reused ID.
    #[test]
    fn vacated_id_is_reused_lowest_first() {
        let mut server = make_server(0, true);
        let a = server.transport_mut().connect();
        let b = server.transport_mut().connect();
        let c = server.transport_mut().connect();
        server.tick();
        assert_eq!(server.registry().client_ids(), vec![0, 1, 2]);
        a.drain();
        b.drain();
        c.drain();

        b.disconnect();
        server.tick();
        a.drain();
        c.drain();

        let d = server.transport_mut().connect();
        server.tick();

        assert_eq!(server.registry().client_ids(), vec![0, 1, 2]);
        let to_a = received(&a);
        assert!(matches!(to_a[..], [ServerMessage::SpawnAvatar { id: 1, .. }]));
        // D's catch-up covers the two survivors.
        assert_eq!(received(&d).len(), 2);
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_handle_stops_the_loop() {
        let mut server = make_server(0, true);
        assert_eq!(server.state(), ServerState::Idle);

        let handle = server.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            handle.shutdown();
        });

        server.run().await;
        assert_eq!(server.state(), ServerState::Stopped);
    }
}

/// REAL SOCKET TESTS
mod tcp_tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    async fn read_message(stream: &mut TcpStream) -> ServerMessage {
        let len = timeout(Duration::from_secs(2), stream.read_u32())
            .await
            .expect("timed out waiting for frame")
            .expect("stream closed") as usize;
        let mut payload = vec![0u8; len];
        timeout(Duration::from_secs(2), stream.read_exact(&mut payload))
            .await
            .expect("timed out reading payload")
            .expect("stream closed");
        ServerMessage::decode(&payload).expect("malformed server message")
    }

    async fn write_payload(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_u32(payload.len() as u32).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Full exchange over real sockets: connect two clients, observe the
    /// announcement and catch-up, then a velocity update reaching both.
    #[tokio::test]
    async fn tcp_end_to_end_exchange() {
        let transport = TcpTransport::bind("127.0.0.1:0", Duration::from_secs(5))
            .await
            .expect("bind failed");
        let addr = transport.local_addr();
        let config = ServerConfig {
            tick_rate: 50,
            include_originator: true,
            min_update_interval: Duration::from_millis(0),
        };
        let mut server = Server::with_sessions(transport, config, SessionStore::with_seed(99));

        let mut first = TcpStream::connect(addr).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        server.tick();

        let mut second = TcpStream::connect(addr).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        server.tick();

        // First client hears about the second; second gets its catch-up.
        assert!(matches!(
            read_message(&mut first).await,
            ServerMessage::SpawnAvatar { id: 1, .. }
        ));
        assert!(matches!(
            read_message(&mut second).await,
            ServerMessage::SpawnAvatar { id: 0, .. }
        ));

        write_payload(&mut second, b"1,1.0,0.0").await;
        sleep(Duration::from_millis(50)).await;
        server.tick();

        assert!(matches!(
            read_message(&mut first).await,
            ServerMessage::UpdatePosition { id: 1, .. }
        ));
        assert!(matches!(
            read_message(&mut second).await,
            ServerMessage::UpdatePosition { id: 1, .. }
        ));

        // Dropping a client is noticed by the prune pass.
        drop(second);
        sleep(Duration::from_millis(50)).await;
        server.tick();
        assert!(matches!(
            read_message(&mut first).await,
            ServerMessage::RemoveAvatar { id: 1 }
        ));
    }
}
