use super::*;
use crate::collaborator::{BanList, JsonTransferStore, StaticShares};
use crate::protocol::TransferReply;
use crate::transfer::FailureReason;
use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

fn core_with(dir: &TempDir, store: bool) -> Core {
    let mut config = Config::default();
    config.server.username = "me".into();
    config.server.description = "hello".into();
    config.transfers.download_dir = dir.path().join("downloads");
    let collaborators = Collaborators {
        shares: Arc::new(StaticShares::new()),
        permissions: Arc::new(BanList::new()),
        store: store.then(|| {
            Arc::new(JsonTransferStore::new(dir.path().join("state")))
                as Arc<dyn TransferStore + Sync>
        }),
    };
    Core::new(config, collaborators)
}

fn login(core: &mut Core) -> Vec<NetCommand> {
    let reply = ServerResponse::Login(LoginReply::Success {
        greeting: "welcome".into(),
        own_ip: Ipv4Addr::new(10, 0, 0, 1),
        password_hash: None,
    });
    core.on_net_event(NetEvent::ServerMessage(reply), Instant::now())
}

fn peer_message(user: &str, message: PeerMessage) -> NetEvent {
    NetEvent::PeerMessage {
        conn: ConnId::from_raw(1),
        user: user.into(),
        message,
    }
}

fn sent_to<'a>(commands: &'a [NetCommand], to: &'a str) -> Vec<&'a PeerMessage> {
    commands
        .iter()
        .filter_map(|command| match command {
            NetCommand::SendPeer { user, message, .. } if user == to => Some(message),
            _ => None,
        })
        .collect()
}

fn drain(events: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

#[test]
fn test_login_announces_status_and_publishes() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    let mut events = core.subscribe();

    let commands = login(&mut core);
    assert!(commands.iter().any(|command| matches!(
        command,
        NetCommand::SendServer(ServerRequest::SetStatus {
            status: UserStatus::Online
        })
    )));
    assert!(core.users().is_logged_in());
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, CoreEvent::LoggedIn { username, .. } if username == "me")));
}

#[test]
fn test_login_failure_disconnects() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    let reply = ServerResponse::Login(LoginReply::Failure {
        reason: "INVALIDPASS".into(),
    });
    let commands = core.on_net_event(NetEvent::ServerMessage(reply), Instant::now());
    assert!(commands
        .iter()
        .any(|command| matches!(command, NetCommand::DisconnectServer)));
    assert!(!core.users().is_logged_in());
}

#[test]
fn test_search_results_need_a_known_token() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    login(&mut core);
    let mut events = core.subscribe();

    let (reply, mut token_rx) = oneshot::channel();
    let commands = core.on_command(
        CoreCommand::Search {
            query: "flac".into(),
            reply,
        },
        Instant::now(),
    );
    let token = token_rx.try_recv().unwrap();
    assert!(commands.iter().any(|command| matches!(
        command,
        NetCommand::SendServer(ServerRequest::FileSearch { token: t, .. }) if *t == token
    )));

    let response = |token| PeerMessage::FileSearchResponse {
        user: "bob".into(),
        token,
        results: Vec::new(),
        free_slots: true,
        upload_speed: 100,
        queue_length: 0,
        private_results: Vec::new(),
    };
    core.on_net_event(peer_message("bob", response(token + 1000)), Instant::now());
    assert!(drain(&mut events).is_empty());

    core.on_net_event(peer_message("bob", response(token)), Instant::now());
    let published = drain(&mut events);
    assert!(matches!(
        published.as_slice(),
        [CoreEvent::SearchResults { query, user, .. }] if query == "flac" && user == "bob"
    ));
}

#[test]
fn test_folder_contents_are_matched_to_requests() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    let mut events = core.subscribe();

    let (reply, mut token_rx) = oneshot::channel();
    core.on_command(
        CoreCommand::BrowseFolder {
            user: "bob".into(),
            folder: "music\\album".into(),
            reply,
        },
        Instant::now(),
    );
    let token = token_rx.try_recv().unwrap();

    let folders = vec![
        FolderContents {
            folder: "music\\other".into(),
            directories: Vec::new(),
        },
        FolderContents {
            folder: "music\\album".into(),
            directories: Vec::new(),
        },
    ];
    let message = PeerMessage::FolderContentsResponse { folders };
    core.on_net_event(peer_message("bob", message.clone()), Instant::now());
    let published = drain(&mut events);
    assert_eq!(published.len(), 1);
    assert!(matches!(
        &published[0],
        CoreEvent::FolderContents { token: t, folder, .. }
            if *t == token && folder == "music\\album"
    ));

    // The request was answered, a repeated response is dropped
    core.on_net_event(peer_message("bob", message), Instant::now());
    assert!(drain(&mut events).is_empty());
}

#[test]
fn test_queue_upload_for_unshared_file_is_denied() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    login(&mut core);
    let message = PeerMessage::QueueUpload {
        file: "music\\missing.mp3".into(),
    };
    let commands = core.on_net_event(peer_message("bob", message), Instant::now());
    assert_eq!(
        sent_to(&commands, "bob"),
        vec![&PeerMessage::UploadDenied {
            file: "music\\missing.mp3".into(),
            reason: "File not shared.".into(),
        }]
    );
}

#[test]
fn test_user_info_request_is_answered() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    let request = peer_message("bob", PeerMessage::UserInfoRequest);
    let commands = core.on_net_event(request, Instant::now());
    assert!(matches!(
        sent_to(&commands, "bob").as_slice(),
        [PeerMessage::UserInfoResponse {
            description,
            queue_size: 0,
            slots_free: true,
            upload_permitted: Some(2),
            ..
        }] if description == "hello"
    ));
}

#[test]
fn test_unknown_file_connection_is_closed() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    let conn = ConnId::from_raw(9);
    let event = NetEvent::DownloadInitReceived {
        conn,
        user: "bob".into(),
        token: 44,
    };
    let commands = core.on_net_event(event, Instant::now());
    assert!(commands
        .iter()
        .any(|command| matches!(command, NetCommand::CloseConnection(c) if *c == conn)));
}

#[test]
fn test_offered_download_is_accepted() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    login(&mut core);
    core.on_command(
        CoreCommand::Download {
            user: "bob".into(),
            virtual_path: "music\\a.mp3".into(),
            folder: None,
            size: 10,
        },
        Instant::now(),
    );

    let offer = PeerMessage::TransferRequest {
        direction: TransferDirection::Upload,
        token: 12,
        file: "music\\a.mp3".into(),
        size: Some(10),
    };
    let commands = core.on_net_event(peer_message("bob", offer), Instant::now());
    assert_eq!(
        sent_to(&commands, "bob"),
        vec![&PeerMessage::TransferResponse {
            token: 12,
            reply: TransferReply::Allowed { size: None },
        }]
    );
    let transfer = core.downloads().get("bob", "music\\a.mp3").unwrap();
    assert_eq!(transfer.status, TransferStatus::Requesting);
}

#[test]
fn test_offline_status_fails_waiting_downloads() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    login(&mut core);
    core.on_command(
        CoreCommand::Download {
            user: "bob".into(),
            virtual_path: "a.mp3".into(),
            folder: None,
            size: 10,
        },
        Instant::now(),
    );
    let mut events = core.subscribe();

    let status = ServerResponse::UserStatus {
        user: "bob".into(),
        status: UserStatus::Offline,
        privileged: None,
    };
    core.on_net_event(NetEvent::ServerMessage(status), Instant::now());
    assert_eq!(
        core.downloads().get("bob", "a.mp3").unwrap().status,
        TransferStatus::Failed(FailureReason::UserLoggedOff)
    );
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        CoreEvent::UserStatus {
            status: UserStatus::Offline,
            ..
        }
    )));
}

#[test]
fn test_transfer_lists_survive_restart() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, true);
    login(&mut core);
    core.on_command(
        CoreCommand::Download {
            user: "bob".into(),
            virtual_path: "music\\a.mp3".into(),
            folder: None,
            size: 10,
        },
        Instant::now(),
    );
    let commands = core.on_command(CoreCommand::Shutdown, Instant::now());
    assert!(commands
        .iter()
        .any(|command| matches!(command, NetCommand::Shutdown)));

    let core = core_with(&dir, true);
    let restored = core.downloads().get("bob", "music\\a.mp3").unwrap();
    assert_eq!(
        restored.status,
        TransferStatus::Failed(FailureReason::UserLoggedOff)
    );
    assert_eq!(restored.size, 10);
}

#[test]
fn test_server_disconnect_fails_downloads() {
    let dir = TempDir::new().unwrap();
    let mut core = core_with(&dir, false);
    login(&mut core);
    core.on_command(
        CoreCommand::Download {
            user: "bob".into(),
            virtual_path: "a.mp3".into(),
            folder: None,
            size: 10,
        },
        Instant::now(),
    );
    let mut events = core.subscribe();
    core.on_net_event(NetEvent::ServerDisconnected, Instant::now());

    assert!(!core.users().is_logged_in());
    assert_eq!(
        core.downloads().get("bob", "a.mp3").unwrap().status,
        TransferStatus::Failed(FailureReason::UserLoggedOff)
    );
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, CoreEvent::Disconnected)));
}
