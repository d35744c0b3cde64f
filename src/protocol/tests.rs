use super::*;
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

fn roundtrip(message: Message) {
    let encoded = message.encode().unwrap();
    match decode(message.frame_kind(), &encoded).unwrap() {
        Decoded::Message(decoded, consumed) => {
            assert_eq!(consumed, encoded.len(), "{:?}", message);
            assert_eq!(decoded, message);
        }
        other => panic!("{:?} decoded as {:?}", message, other),
    }
}

fn sample_file(name: &str) -> SharedFile {
    SharedFile {
        code: 1,
        name: name.to_string(),
        size: 4_500_000,
        extension: "mp3".to_string(),
        attributes: vec![
            FileAttribute { kind: 0, value: 320 },
            FileAttribute { kind: 1, value: 215 },
        ],
    }
}

fn sample_directory(name: &str) -> SharedDirectory {
    SharedDirectory {
        name: name.to_string(),
        files: vec![sample_file("01 intro.mp3"), sample_file("02 song.mp3")],
    }
}

#[test]
fn test_server_request_roundtrip() {
    let requests = vec![
        ServerRequest::Login {
            username: "alice".into(),
            password: "secret".into(),
            version: 160,
            minor_version: 1,
        },
        ServerRequest::SetWaitPort { port: 2234 },
        ServerRequest::GetPeerAddress { user: "bob".into() },
        ServerRequest::WatchUser { user: "bob".into() },
        ServerRequest::UnwatchUser { user: "bob".into() },
        ServerRequest::GetUserStatus { user: "bob".into() },
        ServerRequest::ConnectToPeer {
            token: 77,
            user: "bob".into(),
            conn_type: ConnectionType::File,
        },
        ServerRequest::FileSearch {
            token: 5,
            query: "aphex twin".into(),
        },
        ServerRequest::SetStatus {
            status: UserStatus::Away,
        },
        ServerRequest::ServerPing,
        ServerRequest::SharedFoldersFiles {
            folders: 12,
            files: 340,
        },
        ServerRequest::GetUserStats { user: "bob".into() },
        ServerRequest::UserSearch {
            user: "bob".into(),
            token: 6,
            query: "live".into(),
        },
        ServerRequest::HaveNoParent { no_parent: true },
        ServerRequest::CheckPrivileges,
        ServerRequest::AcceptChildren { accept: false },
        ServerRequest::RoomSearch {
            room: "electronic".into(),
            token: 7,
            query: "ambient".into(),
        },
        ServerRequest::SendUploadSpeed { speed: 102_400 },
        ServerRequest::BranchLevel { level: 2 },
        ServerRequest::BranchRoot { user: "root".into() },
        ServerRequest::CantConnectToPeer {
            token: 9,
            user: "bob".into(),
        },
    ];

    for request in requests {
        roundtrip(Message::ToServer(request));
    }
}

#[test]
fn test_server_response_roundtrip() {
    let responses = vec![
        ServerResponse::Login(LoginReply::Success {
            greeting: "welcome".into(),
            own_ip: Ipv4Addr::new(10, 0, 0, 5),
            password_hash: Some(login_hash("alice", "secret")),
        }),
        ServerResponse::Login(LoginReply::Success {
            greeting: String::new(),
            own_ip: Ipv4Addr::new(192, 168, 1, 2),
            password_hash: None,
        }),
        ServerResponse::Login(LoginReply::Failure {
            reason: "INVALIDPASS".into(),
        }),
        ServerResponse::PeerAddress {
            user: "bob".into(),
            ip: Ipv4Addr::new(1, 2, 3, 4),
            port: 2234,
        },
        ServerResponse::WatchUser {
            user: "bob".into(),
            details: Some(WatchedUser {
                status: UserStatus::Online,
                stats: UserStats {
                    avg_speed: 1000,
                    upload_count: 12,
                    files: 3000,
                    dirs: 100,
                },
                country: Some("NL".into()),
            }),
        },
        ServerResponse::WatchUser {
            user: "bob".into(),
            details: Some(WatchedUser {
                status: UserStatus::Offline,
                stats: UserStats::default(),
                country: None,
            }),
        },
        ServerResponse::WatchUser {
            user: "ghost".into(),
            details: None,
        },
        ServerResponse::UserStatus {
            user: "bob".into(),
            status: UserStatus::Online,
            privileged: Some(true),
        },
        ServerResponse::UserStatus {
            user: "bob".into(),
            status: UserStatus::Offline,
            privileged: None,
        },
        ServerResponse::ConnectToPeer {
            user: "bob".into(),
            conn_type: ConnectionType::Peer,
            ip: Ipv4Addr::new(8, 8, 4, 4),
            port: 50000,
            token: 123,
            privileged: Some(false),
        },
        ServerResponse::FileSearch {
            user: "carol".into(),
            token: 44,
            query: "boards of canada".into(),
        },
        ServerResponse::UserStats {
            user: "bob".into(),
            stats: UserStats {
                avg_speed: 5,
                upload_count: 6,
                files: 7,
                dirs: 8,
            },
        },
        ServerResponse::Relogged,
        ServerResponse::PrivilegedUsers {
            users: vec!["vip1".into(), "vip2".into()],
        },
        ServerResponse::ParentMinSpeed { speed: 1 },
        ServerResponse::ParentSpeedRatio { ratio: 50 },
        ServerResponse::AddToPrivileged { user: "vip3".into() },
        ServerResponse::CheckPrivileges { seconds: 3600 },
        ServerResponse::EmbeddedMessage {
            code: 3,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        },
        ServerResponse::PossibleParents {
            parents: vec![PotentialParent {
                user: "parent".into(),
                ip: Ipv4Addr::new(5, 6, 7, 8),
                port: 2235,
            }],
        },
        ServerResponse::UserPrivileged {
            user: "vip1".into(),
            privileged: true,
        },
        ServerResponse::ResetDistributed,
        ServerResponse::CantConnectToPeer { token: 55 },
    ];

    for response in responses {
        roundtrip(Message::FromServer(response));
    }
}

#[test]
fn test_peer_message_roundtrip() {
    let messages = vec![
        PeerMessage::GetSharedFileList,
        PeerMessage::SharedFileList {
            directories: vec![sample_directory("music\\album"), sample_directory("music\\other")],
            private_directories: vec![],
        },
        PeerMessage::SharedFileList {
            directories: vec![],
            private_directories: vec![sample_directory("private\\stuff")],
        },
        PeerMessage::FileSearchResponse {
            user: "bob".into(),
            token: 99,
            results: vec![sample_file("music\\album\\01 intro.mp3")],
            free_slots: true,
            upload_speed: 250_000,
            queue_length: 3,
            private_results: vec![],
        },
        PeerMessage::UserInfoRequest,
        PeerMessage::UserInfoResponse {
            description: "hello".into(),
            picture: Some(Bytes::from_static(b"\x89PNG")),
            total_uploads: 4,
            queue_size: 10,
            slots_free: true,
            upload_permitted: Some(1),
        },
        PeerMessage::UserInfoResponse {
            description: String::new(),
            picture: None,
            total_uploads: 0,
            queue_size: 0,
            slots_free: false,
            upload_permitted: None,
        },
        PeerMessage::FolderContentsRequest {
            token: 3,
            folder: "music\\album".into(),
        },
        PeerMessage::FolderContentsResponse {
            folders: vec![FolderContents {
                folder: "music\\album".into(),
                directories: vec![sample_directory("music\\album")],
            }],
        },
        PeerMessage::TransferRequest {
            direction: TransferDirection::Upload,
            token: 12,
            file: "music\\album\\01 intro.mp3".into(),
            size: Some(4_500_000),
        },
        PeerMessage::TransferRequest {
            direction: TransferDirection::Download,
            token: 13,
            file: "music\\album\\02 song.mp3".into(),
            size: None,
        },
        PeerMessage::TransferResponse {
            token: 12,
            reply: TransferReply::Allowed { size: None },
        },
        PeerMessage::TransferResponse {
            token: 13,
            reply: TransferReply::Allowed {
                size: Some(5_000_000_000),
            },
        },
        PeerMessage::TransferResponse {
            token: 14,
            reply: TransferReply::Denied {
                reason: Some("Queued".into()),
            },
        },
        PeerMessage::TransferResponse {
            token: 15,
            reply: TransferReply::Denied { reason: None },
        },
        PeerMessage::QueueUpload {
            file: "music\\a.flac".into(),
        },
        PeerMessage::PlaceInQueueResponse {
            file: "music\\a.flac".into(),
            place: 7,
        },
        PeerMessage::UploadFailed {
            file: "music\\a.flac".into(),
        },
        PeerMessage::UploadDenied {
            file: "music\\a.flac".into(),
            reason: "File not shared.".into(),
        },
        PeerMessage::PlaceInQueueRequest {
            file: "music\\a.flac".into(),
        },
        PeerMessage::UploadQueueNotification,
    ];

    for message in messages {
        roundtrip(Message::Peer(message));
    }
}

#[test]
fn test_init_distributed_and_file_roundtrip() {
    let messages = vec![
        Message::Init(PeerInit::PierceFirewall { token: 4242 }),
        Message::Init(PeerInit::PeerInit {
            username: "alice".into(),
            conn_type: ConnectionType::Peer,
            token: 0,
        }),
        Message::Init(PeerInit::PeerInit {
            username: "alice".into(),
            conn_type: ConnectionType::Distributed,
            token: 8,
        }),
        Message::Distributed(DistributedMessage::Ping),
        Message::Distributed(DistributedMessage::Search {
            unknown: 0x31,
            user: "carol".into(),
            token: 100,
            query: "jungle".into(),
        }),
        Message::Distributed(DistributedMessage::BranchLevel { level: -1 }),
        Message::Distributed(DistributedMessage::BranchRoot { user: "root".into() }),
        Message::Distributed(DistributedMessage::ChildDepth { depth: 3 }),
        Message::Distributed(DistributedMessage::EmbeddedMessage {
            code: 3,
            payload: Bytes::from_static(&[9, 9, 9]),
        }),
        Message::FileTransferInit(FileTransferInit { token: 0xDEAD_BEEF }),
        Message::FileOffset(FileOffset {
            offset: 6_000_000_000,
        }),
    ];

    for message in messages {
        roundtrip(message);
    }
}

#[test]
fn test_truncated_frames_need_more_bytes() {
    let messages = vec![
        Message::ToServer(ServerRequest::GetPeerAddress { user: "bob".into() }),
        Message::Peer(PeerMessage::UploadDenied {
            file: "a\\b".into(),
            reason: "Banned".into(),
        }),
        Message::Init(PeerInit::PierceFirewall { token: 1 }),
        Message::Distributed(DistributedMessage::ChildDepth { depth: 3 }),
        Message::FileOffset(FileOffset { offset: 1 }),
    ];

    for message in messages {
        let encoded = message.encode().unwrap();
        for cut in 0..encoded.len() {
            let result = decode(message.frame_kind(), &encoded[..cut]).unwrap();
            assert_eq!(result, Decoded::NeedMoreBytes, "{:?} cut at {}", message, cut);
        }
    }
}

#[test]
fn test_decode_stops_at_declared_length() {
    let first = PeerMessage::QueueUpload { file: "one".into() }.encode().unwrap();
    let second = PeerMessage::QueueUpload { file: "two".into() }.encode().unwrap();
    let mut buf = BytesMut::new();
    buf.put_slice(&first);
    buf.put_slice(&second);

    let consumed = match decode(FrameKind::Peer, &buf).unwrap() {
        Decoded::Message(Message::Peer(PeerMessage::QueueUpload { file }), consumed) => {
            assert_eq!(file, "one");
            consumed
        }
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(consumed, first.len());

    match decode(FrameKind::Peer, &buf[consumed..]).unwrap() {
        Decoded::Message(Message::Peer(PeerMessage::QueueUpload { file }), _) => {
            assert_eq!(file, "two")
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_field_past_declared_length_is_malformed() {
    // Declares a 4-byte string but the frame only has 2 bytes of payload left
    let mut buf = BytesMut::new();
    buf.put_u32_le(4 + 4 + 2);
    buf.put_u32_le(PeerCode::QueueUpload as u32);
    buf.put_u32_le(4);
    buf.put_slice(b"ab");
    // Trailing bytes belong to the next frame and must not be read
    buf.put_slice(b"cd");

    assert!(matches!(
        decode(FrameKind::Peer, &buf).unwrap(),
        Decoded::Malformed { code, consumed: 14, .. } if code == PeerCode::QueueUpload as u32
    ));
}

#[test]
fn test_unknown_code_is_skipped() {
    let mut buf = BytesMut::new();
    buf.put_u32_le(4 + 3);
    buf.put_u32_le(9999);
    buf.put_slice(&[1, 2, 3]);

    assert_eq!(
        decode(FrameKind::Peer, &buf).unwrap(),
        Decoded::Unsupported {
            code: 9999,
            consumed: 11
        }
    );
    assert_eq!(
        decode(FrameKind::Server, &buf).unwrap(),
        Decoded::Unsupported {
            code: 9999,
            consumed: 11
        }
    );
}

#[test]
fn test_oversized_length_is_malformed() {
    let mut buf = BytesMut::new();
    buf.put_u32_le(u32::MAX);
    buf.put_u32_le(5);
    assert!(matches!(
        decode(FrameKind::Peer, &buf),
        Err(ProtocolError::InvalidLength(_))
    ));
}

#[test]
fn test_corrupt_zlib_is_malformed() {
    let mut buf = BytesMut::new();
    buf.put_u32_le(4 + 6);
    buf.put_u32_le(PeerCode::SharedFileList as u32);
    buf.put_slice(b"nozlib");

    assert!(matches!(
        decode(FrameKind::Peer, &buf).unwrap(),
        Decoded::Malformed { consumed: 14, reason, .. } if reason.contains("decompression")
    ));
}

#[test]
fn test_latin1_fallback() {
    let message = PeerMessage::QueueUpload {
        file: "música\\café.mp3".into(),
    };
    let legacy = message.encode_with(TextEncoding::Latin1).unwrap();
    let modern = message.encode().unwrap();

    // Two non-ASCII characters, one byte each instead of two
    assert_eq!(modern.len() - legacy.len(), 2);

    match decode(FrameKind::Peer, &legacy).unwrap() {
        Decoded::Message(Message::Peer(decoded), _) => assert_eq!(decoded, message),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_latin1_keeps_utf8_for_wide_characters() {
    let message = PeerMessage::QueueUpload {
        file: "音楽\\曲.mp3".into(),
    };
    assert_eq!(
        message.encode_with(TextEncoding::Latin1).unwrap(),
        message.encode().unwrap()
    );
}

#[test]
fn test_soulseek_ns_file_size() {
    let mut payload = BytesMut::new();
    payload.put_u32_le(TransferDirection::Upload as u32);
    payload.put_u32_le(1);
    payload.put_u32_le(1);
    payload.put_slice(b"x");
    payload.put_slice(&[0x00, 0x00, 0x00, 0x80, 0xFF, 0xFF, 0xFF, 0xFF]);

    let mut buf = BytesMut::new();
    buf.put_u32_le(4 + payload.len() as u32);
    buf.put_u32_le(PeerCode::TransferRequest as u32);
    buf.put_slice(&payload);

    match decode(FrameKind::Peer, &buf).unwrap() {
        Decoded::Message(Message::Peer(PeerMessage::TransferRequest { size, .. }), _) => {
            assert_eq!(size, Some(0x8000_0000));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_ip_is_reversed_on_wire() {
    let encoded = ServerResponse::PeerAddress {
        user: "u".into(),
        ip: Ipv4Addr::new(1, 2, 3, 4),
        port: 1,
    }
    .encode();
    // len(4) code(4) string(4 + 1) then the address
    assert_eq!(&encoded[13..17], &[4, 3, 2, 1]);
}

#[test]
fn test_peer_init_uses_one_byte_code() {
    let encoded = PeerInit::PierceFirewall { token: 7 }.encode();
    assert_eq!(&encoded[..], &[5, 0, 0, 0, 0, 7, 0, 0, 0]);
}

#[test]
fn test_peer_init_without_token() {
    let mut payload = BytesMut::new();
    payload.put_u32_le(3);
    payload.put_slice(b"bob");
    payload.put_u32_le(1);
    payload.put_slice(b"P");

    let mut buf = BytesMut::new();
    buf.put_u32_le(1 + payload.len() as u32);
    buf.put_u8(1);
    buf.put_slice(&payload);

    match decode(FrameKind::PeerInit, &buf).unwrap() {
        Decoded::Message(Message::Init(PeerInit::PeerInit { username, token, .. }), _) => {
            assert_eq!(username, "bob");
            assert_eq!(token, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_invalid_connection_type_is_malformed() {
    let mut payload = BytesMut::new();
    payload.put_u32_le(3);
    payload.put_slice(b"bob");
    payload.put_u32_le(1);
    payload.put_slice(b"X");
    payload.put_u32_le(0);

    let mut buf = BytesMut::new();
    buf.put_u32_le(1 + payload.len() as u32);
    buf.put_u8(1);
    buf.put_slice(&payload);

    assert!(decode(FrameKind::PeerInit, &buf).is_err());
}

#[test]
fn test_login_hash() {
    assert_eq!(login_hash("", ""), "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(login_hash("a", "bc"), "900150983cd24fb0d6963f7d28e17f72");
}

#[test]
fn test_file_search_drops_nothing_from_query() {
    let request = ServerRequest::FileSearch {
        token: 1,
        query: "daft punk".into(),
    };
    let encoded = request.encode();
    match ServerRequest::decode(&encoded).unwrap() {
        Decoded::Message(decoded, _) => assert_eq!(decoded, request),
        other => panic!("unexpected {:?}", other),
    }
}
