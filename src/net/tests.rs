use super::connection::FileStage;
use super::router::{Action, ConnectIntent, Outgoing, PeerRouter};
use super::*;
use crate::config::NetworkConfig;
use crate::protocol::{
    decode, ConnectionType, Decoded, FrameKind, LoginReply, Message, PeerInit, PeerMessage,
    ServerRequest, ServerResponse, TextEncoding,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn addr() -> SocketAddr {
    "10.0.0.2:2234".parse().unwrap()
}

fn queue_upload(file: &str) -> PeerMessage {
    PeerMessage::QueueUpload { file: file.into() }
}

// ============================================================================
// Connection
// ============================================================================

#[test]
fn test_incoming_connection_decodes_init_then_peer_messages() {
    let now = Instant::now();
    let mut conn = Connection::incoming(ConnId::from_raw(1), addr(), now);
    assert_eq!(conn.expected_frame(), Some(FrameKind::PeerInit));

    let init = PeerInit::PeerInit {
        username: "bob".into(),
        conn_type: ConnectionType::Peer,
        token: 0,
    };
    conn.inbound.extend_from_slice(&init.encode());
    conn.inbound
        .extend_from_slice(&queue_upload("a\\b.mp3").encode().unwrap());

    let first = conn.next_message().unwrap();
    assert_eq!(first, Some(Message::Init(init.clone())));
    assert_eq!(conn.handshake.as_ref().unwrap().received, Some(init));

    conn.bind("bob", ConnectionType::Peer);
    assert_eq!(conn.role, Some(ConnectionRole::Peer));
    let second = conn.next_message().unwrap();
    assert_eq!(second, Some(Message::Peer(queue_upload("a\\b.mp3"))));
    assert_eq!(conn.next_message().unwrap(), None);
    assert!(conn.inbound.is_empty());
}

#[test]
fn test_connection_skips_unknown_codes() {
    let mut conn = Connection::outgoing(ConnId::from_raw(1), addr(), Instant::now());
    conn.bind("bob", ConnectionType::Peer);

    // Code 9999 with a 3 byte payload
    conn.inbound.extend_from_slice(&[7, 0, 0, 0, 0x0F, 0x27, 0, 0, 1, 2, 3]);
    conn.inbound
        .extend_from_slice(&PeerMessage::UploadQueueNotification.encode().unwrap());

    assert_eq!(
        conn.next_message().unwrap(),
        Some(Message::Peer(PeerMessage::UploadQueueNotification))
    );
}

#[test]
fn test_connection_malformed_frame_is_error() {
    let mut conn = Connection::outgoing(ConnId::from_raw(1), addr(), Instant::now());
    conn.bind("bob", ConnectionType::Peer);
    conn.inbound.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 1, 0, 0, 0]);
    assert!(conn.next_message().is_err());
}

#[test]
fn test_connection_drops_corrupt_payload_and_keeps_reading() {
    let mut conn = Connection::outgoing(ConnId::from_raw(1), addr(), Instant::now());
    conn.bind("bob", ConnectionType::Peer);
    // SharedFileList (code 5) whose payload is not zlib
    conn.inbound.extend_from_slice(&[10, 0, 0, 0, 5, 0, 0, 0]);
    conn.inbound.extend_from_slice(b"nozlib");
    conn.inbound
        .extend_from_slice(&queue_upload("music\\a.flac").encode().unwrap());

    assert_eq!(
        conn.next_message().unwrap(),
        Some(Message::Peer(queue_upload("music\\a.flac")))
    );
    assert!(conn.inbound.is_empty());
}

#[test]
fn test_file_connection_expects_token_then_raw() {
    let mut conn = Connection::incoming(ConnId::from_raw(3), addr(), Instant::now());
    conn.bind("bob", ConnectionType::File);
    assert!(matches!(conn.file, Some(FileStage::AwaitingToken)));
    assert_eq!(conn.expected_frame(), Some(FrameKind::FileTransferInit));

    conn.inbound.extend_from_slice(&[42, 0, 0, 0]);
    match conn.next_message().unwrap() {
        Some(Message::FileTransferInit(init)) => assert_eq!(init.token, 42),
        other => panic!("unexpected {:?}", other),
    }

    conn.file = Some(FileStage::AwaitingAttachDownload { token: 42 });
    assert_eq!(conn.expected_frame(), None);
    assert_eq!(conn.file_token(), Some(42));
}

#[test]
fn test_undelivered_messages_track_written_bytes() {
    let mut conn = Connection::outgoing(ConnId::from_raw(1), addr(), Instant::now());
    conn.bind("bob", ConnectionType::Peer);

    let first = queue_upload("one");
    let second = queue_upload("two");
    let first_len = first.encode().unwrap().len();
    conn.queue_peer_message(first.clone(), &first.encode().unwrap());
    conn.queue_peer_message(second.clone(), &second.encode().unwrap());

    // Only the first message fully left the buffer
    conn.on_written(first_len + 2);
    assert_eq!(conn.take_undelivered(), vec![second]);
}

#[test]
fn test_download_read_size_grows_to_cap() {
    let dir = tempfile::tempdir().unwrap();
    let file = std::fs::File::create(dir.path().join("x.incomplete")).unwrap();
    let now = Instant::now();
    let mut conn = Connection::incoming(ConnId::from_raw(1), addr(), now);
    conn.bind("bob", ConnectionType::File);
    conn.start_download(1, file, 0, 1 << 30, now);

    let initial = conn.read_len();
    conn.adapt_read_len(initial / 4);
    assert_eq!(conn.read_len(), initial);

    for _ in 0..20 {
        let len = conn.read_len();
        conn.adapt_read_len(len);
    }
    assert_eq!(conn.read_len(), crate::constants::MAX_DOWNLOAD_READ);
}

// ============================================================================
// Shaper
// ============================================================================

fn run_shaper(policy: ShapingPolicy, limit: u64, conns: &[ConnId], seconds: u64) -> Vec<usize> {
    let start = Instant::now();
    let mut shaper = UploadShaper::new(limit, policy, start);
    for conn in conns {
        shaper.register(*conn, start);
    }

    let mut sent = vec![0usize; conns.len()];
    for step in 1..=(seconds * 10) {
        let now = start + Duration::from_millis(step * 100);
        shaper.begin_pass(now);
        for (i, conn) in conns.iter().enumerate() {
            let budget = shaper.budget(*conn, now).min(1_000_000);
            shaper.consume(*conn, budget, now);
            sent[i] += budget;
        }
    }
    sent
}

#[test]
fn test_split_evenly_converges_to_limit() {
    let conns = [ConnId::from_raw(1), ConnId::from_raw(2)];
    let sent = run_shaper(ShapingPolicy::SplitEvenly, 20_000, &conns, 10);
    let total: usize = sent.iter().sum();

    // 10 seconds at 20 KB/s plus the initial burst allowance
    assert!(total >= 190_000, "total {}", total);
    assert!(total <= 245_000, "total {}", total);
    let diff = sent[0].abs_diff(sent[1]);
    assert!(diff <= 2_000, "{:?}", sent);
}

#[test]
fn test_total_bandwidth_converges_to_limit() {
    let conns = [ConnId::from_raw(1), ConnId::from_raw(2), ConnId::from_raw(3)];
    let sent = run_shaper(ShapingPolicy::TotalBandwidth, 30_000, &conns, 10);
    let total: usize = sent.iter().sum();

    assert!(total >= 285_000, "total {}", total);
    assert!(total <= 365_000, "total {}", total);
    for share in &sent {
        assert!(*share >= 80_000, "{:?}", sent);
    }
}

#[test]
fn test_split_evenly_has_per_connection_floor() {
    let start = Instant::now();
    let mut shaper = UploadShaper::new(1000, ShapingPolicy::SplitEvenly, start);
    let conns: Vec<ConnId> = (1..=4).map(ConnId::from_raw).collect();
    for conn in &conns {
        shaper.register(*conn, start);
    }

    let later = start + Duration::from_secs(10);
    shaper.begin_pass(later);
    // Each connection refills at 1 KiB/s even though 1000 / 4 is lower
    assert_eq!(shaper.budget(conns[0], later), 2048);
}

#[test]
fn test_unlimited_shaper() {
    let now = Instant::now();
    let mut shaper = UploadShaper::unlimited(now);
    let conn = ConnId::from_raw(1);
    shaper.register(conn, now);
    shaper.begin_pass(now);
    assert_eq!(shaper.budget(conn, now), usize::MAX);
    assert_eq!(shaper.read_ahead(conn, usize::MAX), 4096);
    assert_eq!(shaper.read_ahead(conn, 100), 100);
}

#[test]
fn test_rate_meter_smooths_samples() {
    let start = Instant::now();
    let mut meter = RateMeter::new(start);
    meter.record(10_000, start + Duration::from_secs(1));
    assert_eq!(meter.rate(), 10_000);

    meter.record(20_000, start + Duration::from_secs(2));
    let rate = meter.rate();
    assert!((12_999..=13_000).contains(&rate), "rate {}", rate);
}

#[test]
fn test_download_limiter() {
    let now = Instant::now();
    let mut limiter = DownloadLimiter::new(0, now);
    assert_eq!(limiter.budget(now), usize::MAX);

    limiter.set_limit(1000, now);
    assert_eq!(limiter.budget(now), 2000);
    limiter.consume(2000);
    assert_eq!(limiter.budget(now), 0);
    assert_eq!(limiter.budget(now + Duration::from_millis(500)), 500);
}

#[test]
fn test_download_limiter_accepts_huge_limit() {
    let now = Instant::now();
    let mut limiter = DownloadLimiter::new(u64::MAX, now);
    assert!(limiter.budget(now) > 0);
    limiter.set_limit(u64::MAX / 2 + 1, now);
    assert!(limiter.budget(now) > 0);

    let mut shaper = UploadShaper::new(u64::MAX, ShapingPolicy::SplitEvenly, now);
    let conn = ConnId::from_raw(1);
    shaper.register(conn, now);
    shaper.begin_pass(now + Duration::from_secs(1));
    assert!(shaper.budget(conn, now + Duration::from_secs(1)) > 0);
}

// ============================================================================
// Router
// ============================================================================

fn router() -> PeerRouter {
    let mut router = PeerRouter::new();
    router.set_username("me");
    router
}

#[test]
fn test_router_direct_connection() {
    let now = Instant::now();
    let mut router = router();

    let actions = router.send("bob", queue_upload("x"), TextEncoding::Utf8, now);
    assert_eq!(
        actions,
        vec![Action::SendServer(ServerRequest::GetPeerAddress { user: "bob".into() })]
    );

    // A second message while waiting for the address shares the pending init
    let actions = router.send("bob", queue_upload("y"), TextEncoding::Latin1, now);
    assert!(actions.is_empty());
    assert_eq!(router.pending_count(), 1);

    let actions = router.on_peer_address("bob", Ipv4Addr::new(10, 0, 0, 2), 2234, now);
    assert_eq!(
        actions,
        vec![
            Action::Connect {
                addr: addr(),
                intent: ConnectIntent::Direct { token: 1 },
            },
            Action::SendServer(ServerRequest::ConnectToPeer {
                token: 1,
                user: "bob".into(),
                conn_type: ConnectionType::Peer,
            }),
        ]
    );

    let conn = ConnId::from_raw(9);
    let actions = router.on_direct_connected(1, conn);
    assert_eq!(
        actions,
        vec![
            Action::Bind {
                conn,
                user: "bob".into(),
                conn_type: ConnectionType::Peer,
            },
            Action::Write {
                conn,
                out: Outgoing::Init(PeerInit::PeerInit {
                    username: "me".into(),
                    conn_type: ConnectionType::Peer,
                    token: 0,
                }),
            },
            Action::Write {
                conn,
                out: Outgoing::Peer(queue_upload("x"), TextEncoding::Utf8),
            },
            Action::Write {
                conn,
                out: Outgoing::Peer(queue_upload("y"), TextEncoding::Latin1),
            },
        ]
    );
    assert_eq!(router.live_connection("bob", ConnectionType::Peer), Some(conn));

    // Established connections are reused
    let actions = router.send("bob", queue_upload("z"), TextEncoding::Utf8, now);
    assert_eq!(
        actions,
        vec![Action::Write {
            conn,
            out: Outgoing::Peer(queue_upload("z"), TextEncoding::Utf8),
        }]
    );

    router.on_closed(conn);
    assert_eq!(router.live_connection("bob", ConnectionType::Peer), None);
}

#[test]
fn test_router_offline_user() {
    let now = Instant::now();
    let mut router = router();
    router.send("ghost", queue_upload("x"), TextEncoding::Utf8, now);

    let actions = router.on_peer_address("ghost", Ipv4Addr::UNSPECIFIED, 0, now);
    assert_eq!(
        actions,
        vec![Action::Emit(NetEvent::PeerConnectionError {
            user: "ghost".into(),
            conn_type: ConnectionType::Peer,
            undelivered: vec![queue_upload("x")],
            file_token: None,
            offline: true,
        })]
    );
    assert_eq!(router.pending_count(), 0);
}

#[test]
fn test_router_indirect_pierce_wins() {
    let now = Instant::now();
    let mut router = router();
    router.send("bob", queue_upload("x"), TextEncoding::Utf8, now);
    router.on_peer_address("bob", Ipv4Addr::new(10, 0, 0, 2), 2234, now);
    router.on_direct_failed(1);

    let incoming = ConnId::from_raw(4);
    let actions = router.on_incoming_pierce(incoming, 1);
    assert_eq!(
        actions,
        vec![
            Action::Bind {
                conn: incoming,
                user: "bob".into(),
                conn_type: ConnectionType::Peer,
            },
            Action::Write {
                conn: incoming,
                out: Outgoing::Peer(queue_upload("x"), TextEncoding::Utf8),
            },
        ]
    );

    // Late direct socket is no longer needed
    let late = ConnId::from_raw(5);
    assert_eq!(router.on_direct_connected(1, late), vec![Action::Close(late)]);
}

#[test]
fn test_router_unknown_pierce_token_closes() {
    let mut router = router();
    let conn = ConnId::from_raw(2);
    assert_eq!(router.on_incoming_pierce(conn, 999), vec![Action::Close(conn)]);
}

#[test]
fn test_router_cant_connect_waits_for_direct_attempt() {
    let now = Instant::now();
    let mut router = router();
    router.send("bob", queue_upload("x"), TextEncoding::Utf8, now);
    router.on_peer_address("bob", Ipv4Addr::new(10, 0, 0, 2), 2234, now);

    assert!(router.on_cant_connect(1).is_empty());
    let actions = router.on_direct_failed(1);
    assert!(matches!(
        actions.as_slice(),
        [Action::Emit(NetEvent::PeerConnectionError { offline: false, .. })]
    ));
}

#[test]
fn test_router_expires_indirect_requests() {
    let now = Instant::now();
    let mut router = router();
    router.send("bob", queue_upload("x"), TextEncoding::Utf8, now);
    router.on_peer_address("bob", Ipv4Addr::new(10, 0, 0, 2), 2234, now);

    assert!(router.expire(now + Duration::from_secs(19)).is_empty());
    let actions = router.expire(now + Duration::from_secs(20));
    assert_eq!(actions.len(), 1);
    assert_eq!(router.pending_count(), 0);

    // The cached address is dropped, the next attempt asks the server again
    let actions = router.send("bob", queue_upload("y"), TextEncoding::Utf8, now);
    assert_eq!(
        actions,
        vec![Action::SendServer(ServerRequest::GetPeerAddress { user: "bob".into() })]
    );
}

#[test]
fn test_router_file_connection_sends_token() {
    let now = Instant::now();
    let mut router = router();
    router.on_peer_address("bob", Ipv4Addr::new(10, 0, 0, 2), 2234, now);

    let actions = router.open_file_connection("bob", 555, now);
    assert!(matches!(
        actions.as_slice(),
        [
            Action::Connect { intent: ConnectIntent::Direct { token: 1 }, .. },
            Action::SendServer(ServerRequest::ConnectToPeer {
                conn_type: ConnectionType::File,
                ..
            }),
        ]
    ));

    let conn = ConnId::from_raw(8);
    let actions = router.on_direct_connected(1, conn);
    assert_eq!(
        actions.last(),
        Some(&Action::Write {
            conn,
            out: Outgoing::FileTransferInit(555),
        })
    );
    // File connections are never reused
    assert_eq!(router.live_connection("bob", ConnectionType::File), None);
}

#[test]
fn test_router_answers_connect_request_with_pierce() {
    let mut router = router();
    let actions = router.on_connect_request(
        "carol",
        ConnectionType::File,
        Ipv4Addr::new(10, 0, 0, 3),
        2240,
        31,
    );
    assert_eq!(
        actions,
        vec![Action::Connect {
            addr: "10.0.0.3:2240".parse().unwrap(),
            intent: ConnectIntent::Pierce {
                user: "carol".into(),
                conn_type: ConnectionType::File,
                token: 31,
            },
        }]
    );

    let conn = ConnId::from_raw(6);
    let actions = router.on_pierce_connected(conn, "carol", ConnectionType::File, 31);
    assert_eq!(
        actions[1],
        Action::Write {
            conn,
            out: Outgoing::Init(PeerInit::PierceFirewall { token: 31 }),
        }
    );

    assert_eq!(
        router.on_pierce_failed("carol", 31),
        vec![Action::SendServer(ServerRequest::CantConnectToPeer {
            token: 31,
            user: "carol".into(),
        })]
    );
}

#[test]
fn test_router_incoming_peer_init_flushes_pending() {
    let now = Instant::now();
    let mut router = router();
    router.send("bob", queue_upload("x"), TextEncoding::Utf8, now);

    let conn = ConnId::from_raw(3);
    let actions = router.on_incoming_peer_init(conn, "bob", ConnectionType::Peer);
    assert_eq!(actions.len(), 2);
    assert_eq!(router.pending_count(), 0);
    assert_eq!(router.live_connection("bob", ConnectionType::Peer), Some(conn));
}

// ============================================================================
// Engine over loopback
// ============================================================================

async fn read_message(stream: &mut TcpStream, kind: FrameKind) -> Message {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Decoded::Message(message, _) = decode(kind, &buf).unwrap() {
            return message;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed early");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn next_event(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<NetEvent>,
    want: impl Fn(&NetEvent) -> bool,
) -> NetEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("engine stopped");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_engine_logs_in_against_fake_server() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (engine, handle, mut events) = NetworkEngine::new(&NetworkConfig::default(), None);
    tokio::spawn(engine.run());

    handle
        .send(NetCommand::ConnectServer {
            addr: server_addr,
            username: "alice".into(),
            password: "secret".into(),
            listen_port: 2234,
        })
        .unwrap();

    let (mut socket, _) = server.accept().await.unwrap();
    match read_message(&mut socket, FrameKind::ServerRequest).await {
        Message::ToServer(ServerRequest::Login { username, .. }) => assert_eq!(username, "alice"),
        other => panic!("expected login, got {:?}", other),
    }

    let reply = ServerResponse::Login(LoginReply::Success {
        greeting: "welcome".into(),
        own_ip: Ipv4Addr::new(127, 0, 0, 1),
        password_hash: None,
    });
    socket.write_all(&reply.encode()).await.unwrap();

    next_event(&mut events, |e| matches!(e, NetEvent::ServerConnected { .. })).await;
    let event = next_event(&mut events, |e| matches!(e, NetEvent::ServerMessage(_))).await;
    assert_eq!(event, NetEvent::ServerMessage(reply));

    drop(socket);
    next_event(&mut events, |e| matches!(e, NetEvent::ServerDisconnected)).await;

    handle.send(NetCommand::Shutdown).unwrap();
}

#[tokio::test]
async fn test_engine_accepts_incoming_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();

    let (engine, handle, mut events) =
        NetworkEngine::new(&NetworkConfig::default(), Some(listener));
    tokio::spawn(engine.run());

    let mut peer = TcpStream::connect(listen_addr).await.unwrap();
    let init = PeerInit::PeerInit {
        username: "bob".into(),
        conn_type: ConnectionType::Peer,
        token: 0,
    };
    peer.write_all(&init.encode()).await.unwrap();
    peer.write_all(&queue_upload("music\\a.flac").encode().unwrap())
        .await
        .unwrap();

    match next_event(&mut events, |e| matches!(e, NetEvent::PeerConnected { .. })).await {
        NetEvent::PeerConnected { user, conn_type, .. } => {
            assert_eq!(user, "bob");
            assert_eq!(conn_type, ConnectionType::Peer);
        }
        _ => unreachable!(),
    }

    let conn = match next_event(&mut events, |e| matches!(e, NetEvent::PeerMessage { .. })).await {
        NetEvent::PeerMessage { conn, user, message } => {
            assert_eq!(user, "bob");
            assert_eq!(message, queue_upload("music\\a.flac"));
            conn
        }
        _ => unreachable!(),
    };

    // Replies go out over the same socket
    handle
        .send(NetCommand::SendPeer {
            user: "bob".into(),
            message: PeerMessage::UploadDenied {
                file: "music\\a.flac".into(),
                reason: "File not shared.".into(),
            },
            encoding: TextEncoding::Utf8,
        })
        .unwrap();
    match read_message(&mut peer, FrameKind::Peer).await {
        Message::Peer(PeerMessage::UploadDenied { reason, .. }) => {
            assert_eq!(reason, "File not shared.")
        }
        other => panic!("unexpected {:?}", other),
    }

    drop(peer);
    let event = next_event(&mut events, |e| matches!(e, NetEvent::ConnectionClosed { .. })).await;
    assert!(matches!(
        event,
        NetEvent::ConnectionClosed { conn: c, reason: CloseReason::Remote, .. } if c == conn
    ));

    handle.send(NetCommand::Shutdown).unwrap();
}

#[tokio::test]
async fn test_engine_reports_server_connect_failure() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (engine, handle, mut events) = NetworkEngine::new(&NetworkConfig::default(), None);
    tokio::spawn(engine.run());

    handle
        .send(NetCommand::ConnectServer {
            addr,
            username: "alice".into(),
            password: "secret".into(),
            listen_port: 2234,
        })
        .unwrap();

    let event = next_event(&mut events, |e| {
        matches!(e, NetEvent::ServerConnectFailed { .. })
    })
    .await;
    assert!(matches!(event, NetEvent::ServerConnectFailed { addr: a, .. } if a == addr));
    handle.send(NetCommand::Shutdown).unwrap();
}

#[tokio::test]
async fn test_engine_drops_incoming_sockets_over_the_cap() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();

    // The listener itself takes one of the two sockets
    let config = NetworkConfig {
        max_sockets: 2,
        ..NetworkConfig::default()
    };
    let (engine, handle, mut events) = NetworkEngine::new(&config, Some(listener));
    tokio::spawn(engine.run());

    let mut first = TcpStream::connect(listen_addr).await.unwrap();
    let init = PeerInit::PeerInit {
        username: "bob".into(),
        conn_type: ConnectionType::Peer,
        token: 0,
    };
    first.write_all(&init.encode()).await.unwrap();
    next_event(&mut events, |e| matches!(e, NetEvent::PeerConnected { .. })).await;

    let mut second = TcpStream::connect(listen_addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    handle.send(NetCommand::Shutdown).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_engine_closes_idle_peer_connection() {
    use crate::constants::CONNECTION_MAX_IDLE;

    // Virtual time jumps ahead while the engine waits, so allow well past the idle limit
    async fn wait_for(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<NetEvent>,
        want: impl Fn(&NetEvent) -> bool,
    ) -> NetEvent {
        tokio::time::timeout(CONNECTION_MAX_IDLE * 5, async {
            loop {
                let event = events.recv().await.expect("engine stopped");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let (engine, handle, mut events) =
        NetworkEngine::new(&NetworkConfig::default(), Some(listener));
    tokio::spawn(engine.run());

    let mut peer = TcpStream::connect(listen_addr).await.unwrap();
    let init = PeerInit::PeerInit {
        username: "bob".into(),
        conn_type: ConnectionType::Peer,
        token: 0,
    };
    peer.write_all(&init.encode()).await.unwrap();

    let conn = match wait_for(&mut events, |e| matches!(e, NetEvent::PeerConnected { .. })).await
    {
        NetEvent::PeerConnected { conn, .. } => conn,
        _ => unreachable!(),
    };
    let opened = tokio::time::Instant::now();
    wait_for(&mut events, |e| {
        matches!(e, NetEvent::Stats(stats) if stats.connections == 1)
    })
    .await;

    let event = wait_for(&mut events, |e| {
        matches!(e, NetEvent::ConnectionClosed { .. })
    })
    .await;
    assert!(matches!(
        event,
        NetEvent::ConnectionClosed { conn: c, reason: CloseReason::Idle, .. } if c == conn
    ));
    assert!(opened.elapsed() >= CONNECTION_MAX_IDLE - Duration::from_secs(1));

    wait_for(&mut events, |e| {
        matches!(e, NetEvent::Stats(stats) if stats.connections == 0)
    })
    .await;
    assert_eq!(handle.stats().connections, 0);

    let mut buf = [0u8; 1];
    assert!(matches!(peer.read(&mut buf).await, Ok(0) | Err(_)));
    handle.send(NetCommand::Shutdown).unwrap();
}
