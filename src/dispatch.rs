//! The core dispatcher.
//!
//! [`Core`] sits between the network engine and the transfer queues. Network
//! events are routed to [`Downloads`] and [`Uploads`], whose outgoing
//! messages go back to the engine, and everything a listener may care about
//! is published as a [`CoreEvent`] on a broadcast channel.
//!
//! The dispatcher also correlates tokens of requests it issued itself
//! (searches, folder browsing): responses carrying a token nobody asked for
//! are dropped.
//!
//! All handlers are synchronous and return the [`NetCommand`]s to send, so
//! the routing can be exercised without sockets. [`Core::run`] drives them
//! from the engine's event channel, a command channel and a one second tick.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::lookup_host;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collaborator::{PermissionChecker, PermissionLevel, ShareIndex, TransferStore};
use crate::config::{Config, TransferConfig};
use crate::constants::{CORE_EVENT_CAPACITY, CORE_TICK_INTERVAL, TRANSFER_SAVE_INTERVAL};
use crate::net::{ConnId, ConnectionStats, NetCommand, NetEvent, NetHandle};
use crate::protocol::{
    ConnectionType, DistributedMessage, FolderContents, LoginReply, PeerMessage, ServerRequest,
    ServerResponse, SharedDirectory, SharedFile, TextEncoding, TransferDirection, UserStatus,
};
use crate::token::{TokenClass, TokenGenerator};
use crate::transfer::{
    Downloads, Outbox, QueueContext, TransferEvent, TransferKind, TransferStatus, Uploads,
};
use crate::users::UserDirectory;

/// Requests accepted by the core.
#[derive(Debug)]
pub enum CoreCommand {
    /// Connects and logs in with the configured credentials.
    Connect,
    Disconnect,
    Download {
        user: String,
        virtual_path: String,
        folder: Option<PathBuf>,
        size: u64,
    },
    /// Queues one of our files for `user`.
    PushUpload {
        user: String,
        virtual_path: String,
        size: Option<u64>,
    },
    AbortDownload { user: String, virtual_path: String },
    RetryDownload { user: String, virtual_path: String },
    ClearDownload { user: String, virtual_path: String },
    ClearFinishedDownloads,
    AbortUpload { user: String, virtual_path: String },
    RetryUpload { user: String, virtual_path: String },
    ClearUpload { user: String, virtual_path: String },
    ClearFinishedUploads,
    /// Starts a network-wide search; the token is sent back on `reply`.
    Search {
        query: String,
        reply: oneshot::Sender<u32>,
    },
    /// Searches the shares of a single user.
    UserSearch {
        user: String,
        query: String,
        reply: oneshot::Sender<u32>,
    },
    /// Asks `user` for the contents of one folder.
    BrowseFolder {
        user: String,
        folder: String,
        reply: oneshot::Sender<u32>,
    },
    GetSharedFileList { user: String },
    GetUserInfo { user: String },
    WatchUser { user: String },
    /// Sends a message prepared outside the core, such as a search response.
    SendPeer { user: String, message: PeerMessage },
    SetDownloadFilters(Vec<String>),
    UpdateTransferConfig(TransferConfig),
    Shutdown,
}

/// Events published to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    LoggedIn {
        username: String,
        greeting: String,
        own_ip: Ipv4Addr,
    },
    LoginFailed { reason: String },
    /// Another client logged in with our name.
    Relogged,
    Disconnected,
    ConnectFailed { error: String },
    UserStatus { user: String, status: UserStatus },
    Transfer(TransferEvent),
    PeerConnected { user: String, conn_type: ConnectionType },
    SearchResults {
        token: u32,
        query: String,
        user: String,
        results: Vec<SharedFile>,
        private_results: Vec<SharedFile>,
        free_slots: bool,
        upload_speed: u32,
        queue_length: u32,
    },
    FolderContents {
        user: String,
        token: u32,
        folder: String,
        directories: Vec<SharedDirectory>,
    },
    SharedFileList {
        user: String,
        directories: Vec<SharedDirectory>,
        private_directories: Vec<SharedDirectory>,
    },
    UserInfo {
        user: String,
        description: String,
        total_uploads: u32,
        queue_size: u32,
        slots_free: bool,
    },
    /// Someone searches the network. Answering needs the share index.
    SearchRequest { user: String, token: u32, query: String },
    /// A peer wants our share list or a folder of it.
    ShareRequest { user: String, message: PeerMessage },
    Stats(ConnectionStats),
}

/// Components the core consults but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub shares: Arc<dyn ShareIndex>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub store: Option<Arc<dyn TransferStore + Sync>>,
}

/// State read by the queues, split from them so both can be borrowed at once.
struct Env {
    shares: Arc<dyn ShareIndex>,
    permissions: Arc<dyn PermissionChecker>,
    users: UserDirectory,
    tokens: TokenGenerator,
    upload_speed: u64,
    shutting_down: bool,
}

impl Env {
    fn ctx(&mut self, now: Instant) -> QueueContext<'_> {
        QueueContext {
            shares: self.shares.as_ref(),
            permissions: self.permissions.as_ref(),
            users: &self.users,
            tokens: &mut self.tokens,
            upload_speed: self.upload_speed,
            shutting_down: self.shutting_down,
            now,
        }
    }
}

/// Routes network events to the transfer queues and publishes the results.
pub struct Core {
    config: Config,
    env: Env,
    downloads: Downloads,
    uploads: Uploads,
    store: Option<Arc<dyn TransferStore + Sync>>,
    events: broadcast::Sender<CoreEvent>,
    username: Option<String>,
    searches: HashMap<u32, String>,
    browses: HashMap<(String, String), u32>,
    dirty: bool,
    last_save: Instant,
}

impl Core {
    /// Creates the core and restores saved transfer lists.
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(CORE_EVENT_CAPACITY);
        let mut downloads = Downloads::new(&config.transfers);
        let mut uploads = Uploads::new(&config.transfers);

        if let Some(store) = &collaborators.store {
            match store.load(TransferKind::Download) {
                Ok(records) => downloads.restore(records),
                Err(e) => warn!(error = %e, "cannot load download list"),
            }
            match store.load(TransferKind::Upload) {
                Ok(records) => uploads.restore(records),
                Err(e) => warn!(error = %e, "cannot load upload list"),
            }
        }

        Self {
            config,
            env: Env {
                shares: collaborators.shares,
                permissions: collaborators.permissions,
                users: UserDirectory::new(),
                tokens: TokenGenerator::new(),
                upload_speed: 0,
                shutting_down: false,
            },
            downloads,
            uploads,
            store: collaborators.store,
            events,
            username: None,
            searches: HashMap::new(),
            browses: HashMap::new(),
            dirty: false,
            last_save: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for subscribing after the core
    /// moved to the network thread.
    pub fn event_sender(&self) -> broadcast::Sender<CoreEvent> {
        self.events.clone()
    }

    pub fn downloads(&self) -> &Downloads {
        &self.downloads
    }

    pub fn uploads(&self) -> &Uploads {
        &self.uploads
    }

    pub fn users(&self) -> &UserDirectory {
        &self.env.users
    }

    fn publish(&self, event: CoreEvent) {
        // Having no listener is fine
        let _ = self.events.send(event);
    }

    /// Publishes queue events and returns the queue's network commands.
    fn flush(&mut self, out: Outbox) -> Vec<NetCommand> {
        if !out.events.is_empty() {
            self.dirty = true;
        }
        for event in out.events {
            self.publish(CoreEvent::Transfer(event));
        }
        out.commands
    }

    // ========================================================================
    // Network events
    // ========================================================================

    pub fn on_net_event(&mut self, event: NetEvent, now: Instant) -> Vec<NetCommand> {
        let mut out = Outbox::new();
        match event {
            NetEvent::ServerConnected { addr } => {
                debug!(%addr, "server connected, waiting for login reply");
            }
            NetEvent::ServerConnectFailed { error, .. } => {
                self.on_server_lost(now, &mut out);
                self.publish(CoreEvent::ConnectFailed { error });
            }
            NetEvent::ServerDisconnected => {
                self.on_server_lost(now, &mut out);
                self.publish(CoreEvent::Disconnected);
            }
            NetEvent::ServerMessage(response) => self.on_server_message(response, now, &mut out),
            NetEvent::PeerConnected {
                user, conn_type, ..
            } => {
                self.publish(CoreEvent::PeerConnected { user, conn_type });
            }
            NetEvent::PeerMessage {
                conn,
                user,
                message,
            } => self.on_peer_message(conn, &user, message, now, &mut out),
            NetEvent::DistributedMessage { message, .. } => self.on_distributed_message(message),
            NetEvent::PeerConnectionError {
                user,
                undelivered,
                file_token,
                offline,
                ..
            } => {
                self.on_undelivered(&user, &undelivered, file_token, offline, now, &mut out);
            }
            NetEvent::ConnectionClosed {
                user: Some(user),
                undelivered,
                ..
            } if !undelivered.is_empty() => {
                let offline = self.env.users.is_offline(&user);
                self.on_undelivered(&user, &undelivered, None, offline, now, &mut out);
            }
            NetEvent::ConnectionClosed { conn, reason, .. } => {
                debug!(?conn, ?reason, "connection closed");
            }
            NetEvent::DownloadInitReceived { conn, user, token } => {
                let ctx = self.env.ctx(now);
                if !self.downloads.on_file_init(conn, &user, token, &ctx, &mut out) {
                    debug!(%user, token, "file connection for unknown download");
                    out.command(NetCommand::CloseConnection(conn));
                }
            }
            NetEvent::UploadOffsetReceived {
                conn,
                user,
                token,
                offset,
            } => {
                let mut ctx = self.env.ctx(now);
                self.uploads
                    .on_upload_offset(conn, &user, token, offset, &mut ctx, &mut out);
            }
            NetEvent::DownloadProgress {
                user,
                token,
                offset,
            } => {
                let ctx = self.env.ctx(now);
                self.downloads.on_progress(&user, token, offset, &ctx, &mut out);
            }
            NetEvent::UploadProgress {
                user,
                token,
                offset,
                speed,
            } => {
                let ctx = self.env.ctx(now);
                self.uploads
                    .on_progress(&user, token, offset, speed, &ctx, &mut out);
            }
            NetEvent::DownloadFileError { user, token, error } => {
                self.downloads.on_file_error(&user, token, &error, &mut out);
            }
            NetEvent::UploadFileError { user, token, error } => {
                self.uploads.on_file_error(&user, token, &error, &mut out);
            }
            NetEvent::DownloadConnectionClosed {
                user,
                token,
                offset,
            } => {
                let ctx = self.env.ctx(now);
                self.downloads
                    .on_connection_closed(&user, token, offset, &ctx, &mut out);
            }
            NetEvent::UploadConnectionClosed {
                user,
                token,
                offset,
                timed_out,
            } => {
                let mut ctx = self.env.ctx(now);
                self.uploads
                    .on_connection_closed(&user, token, offset, timed_out, &mut ctx, &mut out);
            }
            NetEvent::Stats(stats) => {
                self.env.upload_speed = stats.upload_speed;
                self.publish(CoreEvent::Stats(stats));
            }
        }
        self.flush(out)
    }

    fn on_server_lost(&mut self, now: Instant, out: &mut Outbox) {
        if self.username.take().is_some() {
            info!("logged out");
        }
        self.env.users.clear();
        self.searches.clear();
        self.browses.clear();
        self.downloads.on_disconnect(out);
        self.uploads.on_disconnect(out);
        self.save(now);
    }

    fn on_server_message(&mut self, response: ServerResponse, now: Instant, out: &mut Outbox) {
        if let Some((user, status)) = self.env.users.apply(&response) {
            let online = status.is_online();
            let mut ctx = self.env.ctx(now);
            self.downloads.on_user_status(&user, online, &ctx, out);
            self.uploads.on_user_status(&user, online, &mut ctx, out);
            self.publish(CoreEvent::UserStatus { user, status });
            return;
        }

        match response {
            ServerResponse::Login(LoginReply::Success {
                greeting, own_ip, ..
            }) => {
                let username = self.config.server.username.clone();
                info!(user = %username, "logged in");
                self.env.users.set_logged_in(true);
                self.username = Some(username.clone());

                out.send_server(ServerRequest::SetStatus {
                    status: UserStatus::Online,
                });
                out.send_server(ServerRequest::HaveNoParent { no_parent: true });
                out.send_server(ServerRequest::CheckPrivileges);

                let mut ctx = self.env.ctx(now);
                self.downloads.start(&ctx, out);
                self.uploads.start(&mut ctx, out);
                self.publish(CoreEvent::LoggedIn {
                    username,
                    greeting,
                    own_ip,
                });
            }
            ServerResponse::Login(LoginReply::Failure { reason }) => {
                warn!(%reason, "login refused");
                out.command(NetCommand::DisconnectServer);
                self.publish(CoreEvent::LoginFailed { reason });
            }
            ServerResponse::Relogged => {
                warn!("logged in from another client");
                self.publish(CoreEvent::Relogged);
            }
            ServerResponse::FileSearch { user, token, query } => {
                self.publish(CoreEvent::SearchRequest { user, token, query });
            }
            ServerResponse::CheckPrivileges { seconds } => {
                debug!(seconds, "privileges left");
            }
            other => debug!(code = ?other.code(), "unhandled server message"),
        }
    }

    fn on_peer_message(
        &mut self,
        conn: ConnId,
        user: &str,
        message: PeerMessage,
        now: Instant,
        out: &mut Outbox,
    ) {
        match message {
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token,
                file,
                size,
            } => {
                let ctx = self.env.ctx(now);
                self.downloads
                    .on_transfer_request(user, token, &file, size, &ctx, out);
            }
            PeerMessage::TransferRequest {
                direction: TransferDirection::Download,
                token,
                file,
                ..
            } => {
                let mut ctx = self.env.ctx(now);
                self.uploads
                    .on_transfer_request(user, token, &file, &mut ctx, out);
            }
            PeerMessage::TransferResponse { token, reply } => {
                let mut ctx = self.env.ctx(now);
                self.uploads
                    .on_transfer_response(user, token, &reply, &mut ctx, out);
            }
            PeerMessage::QueueUpload { file } => {
                let mut ctx = self.env.ctx(now);
                self.uploads.on_queue_upload(user, &file, &mut ctx, out);
            }
            PeerMessage::PlaceInQueueRequest { file } => {
                let ctx = self.env.ctx(now);
                self.uploads
                    .on_place_in_queue_request(user, &file, &ctx, out);
            }
            PeerMessage::PlaceInQueueResponse { file, place } => {
                self.downloads
                    .on_place_in_queue_response(user, &file, place, out);
            }
            PeerMessage::UploadDenied { file, reason } => {
                let ctx = self.env.ctx(now);
                self.downloads
                    .on_upload_denied(user, &file, &reason, &ctx, out);
            }
            PeerMessage::UploadFailed { file } => {
                let ctx = self.env.ctx(now);
                self.downloads.on_upload_failed(user, &file, &ctx, out);
            }
            PeerMessage::UploadQueueNotification => {
                info!(user, "peer queued a file for us");
            }
            PeerMessage::FileSearchResponse {
                token,
                results,
                free_slots,
                upload_speed,
                queue_length,
                private_results,
                ..
            } => {
                let Some(query) = self.searches.get(&token).cloned() else {
                    debug!(user, token, "search results for unknown token");
                    return;
                };
                self.publish(CoreEvent::SearchResults {
                    token,
                    query,
                    user: user.to_string(),
                    results,
                    private_results,
                    free_slots,
                    upload_speed,
                    queue_length,
                });
            }
            PeerMessage::FolderContentsResponse { folders } => {
                for FolderContents {
                    folder,
                    directories,
                } in folders
                {
                    let key = (user.to_string(), folder);
                    let Some(token) = self.browses.remove(&key) else {
                        debug!(user, folder = %key.1, "unrequested folder contents");
                        continue;
                    };
                    self.publish(CoreEvent::FolderContents {
                        user: key.0,
                        token,
                        folder: key.1,
                        directories,
                    });
                }
            }
            PeerMessage::SharedFileList {
                directories,
                private_directories,
            } => {
                self.publish(CoreEvent::SharedFileList {
                    user: user.to_string(),
                    directories,
                    private_directories,
                });
            }
            PeerMessage::UserInfoRequest => self.answer_user_info(user, now, out),
            PeerMessage::UserInfoResponse {
                description,
                total_uploads,
                queue_size,
                slots_free,
                ..
            } => {
                self.publish(CoreEvent::UserInfo {
                    user: user.to_string(),
                    description,
                    total_uploads,
                    queue_size,
                    slots_free,
                });
            }
            message @ (PeerMessage::GetSharedFileList
            | PeerMessage::FolderContentsRequest { .. }) => {
                let ip = self.env.users.address(user);
                let (level, _) = self.env.permissions.check_user_permission(user, ip);
                if level == PermissionLevel::Banned {
                    debug!(user, ?conn, "ignoring share request from banned user");
                    return;
                }
                self.publish(CoreEvent::ShareRequest {
                    user: user.to_string(),
                    message,
                });
            }
        }
    }

    fn answer_user_info(&mut self, user: &str, now: Instant, out: &mut Outbox) {
        let ctx = self.env.ctx(now);
        let total_uploads = self
            .uploads
            .queue()
            .iter()
            .filter(|t| t.status == TransferStatus::Finished)
            .count();
        let message = PeerMessage::UserInfoResponse {
            description: self.config.server.description.clone(),
            picture: None,
            total_uploads: total_uploads as u32,
            queue_size: self.uploads.queue_size_for(user, &ctx) as u32,
            slots_free: self.uploads.has_free_slots(&ctx),
            upload_permitted: Some(self.config.transfers.remote_uploads.wire_value()),
        };
        out.send_peer(user, message, TextEncoding::Utf8);
    }

    fn on_distributed_message(&mut self, message: DistributedMessage) {
        match message {
            DistributedMessage::Search {
                user, token, query, ..
            } => {
                self.publish(CoreEvent::SearchRequest { user, token, query });
            }
            other => debug!(code = ?other.code(), "distributed message"),
        }
    }

    fn on_undelivered(
        &mut self,
        user: &str,
        undelivered: &[PeerMessage],
        file_token: Option<u32>,
        offline: bool,
        now: Instant,
        out: &mut Outbox,
    ) {
        debug!(user, count = undelivered.len(), offline, "messages not delivered");
        self.downloads
            .on_peer_connection_error(user, undelivered, offline, out);
        let mut ctx = self.env.ctx(now);
        self.uploads
            .on_peer_connection_error(user, undelivered, file_token, offline, &mut ctx, out);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Applies a command. [`CoreCommand::Connect`] needs name resolution and
    /// is handled by [`Core::run`].
    pub fn on_command(&mut self, command: CoreCommand, now: Instant) -> Vec<NetCommand> {
        let mut out = Outbox::new();
        match command {
            CoreCommand::Connect => {
                warn!("connect requested outside the core loop");
            }
            CoreCommand::Disconnect => out.command(NetCommand::DisconnectServer),
            CoreCommand::Download {
                user,
                virtual_path,
                folder,
                size,
            } => {
                let mut ctx = self.env.ctx(now);
                self.downloads
                    .enqueue(&user, &virtual_path, folder, size, &mut ctx, &mut out);
            }
            CoreCommand::PushUpload {
                user,
                virtual_path,
                size,
            } => {
                let mut ctx = self.env.ctx(now);
                self.uploads
                    .push_file(&user, &virtual_path, size, &mut ctx, &mut out);
            }
            CoreCommand::AbortDownload { user, virtual_path } => {
                self.downloads.abort(&user, &virtual_path, &mut out);
            }
            CoreCommand::RetryDownload { user, virtual_path } => {
                let ctx = self.env.ctx(now);
                self.downloads.retry(&user, &virtual_path, &ctx, &mut out);
            }
            CoreCommand::ClearDownload { user, virtual_path } => {
                self.downloads.clear(&user, &virtual_path, &mut out);
            }
            CoreCommand::ClearFinishedDownloads => self.downloads.clear_finished(&mut out),
            CoreCommand::AbortUpload { user, virtual_path } => {
                let mut ctx = self.env.ctx(now);
                self.uploads.abort(&user, &virtual_path, &mut ctx, &mut out);
            }
            CoreCommand::RetryUpload { user, virtual_path } => {
                let mut ctx = self.env.ctx(now);
                self.uploads.retry(&user, &virtual_path, &mut ctx, &mut out);
            }
            CoreCommand::ClearUpload { user, virtual_path } => {
                let mut ctx = self.env.ctx(now);
                self.uploads.clear(&user, &virtual_path, &mut ctx, &mut out);
            }
            CoreCommand::ClearFinishedUploads => self.uploads.clear_finished(&mut out),
            CoreCommand::Search { query, reply } => {
                let token = self.env.tokens.next(TokenClass::Search);
                self.searches.insert(token, query.clone());
                out.send_server(ServerRequest::FileSearch { token, query });
                let _ = reply.send(token);
            }
            CoreCommand::UserSearch { user, query, reply } => {
                let token = self.env.tokens.next(TokenClass::Search);
                self.searches.insert(token, query.clone());
                out.send_server(ServerRequest::UserSearch { user, token, query });
                let _ = reply.send(token);
            }
            CoreCommand::BrowseFolder {
                user,
                folder,
                reply,
            } => {
                let token = self.env.tokens.next(TokenClass::FolderContents);
                self.browses.insert((user.clone(), folder.clone()), token);
                out.send_peer(
                    &user,
                    PeerMessage::FolderContentsRequest { token, folder },
                    TextEncoding::Utf8,
                );
                let _ = reply.send(token);
            }
            CoreCommand::GetSharedFileList { user } => {
                out.send_peer(&user, PeerMessage::GetSharedFileList, TextEncoding::Utf8);
            }
            CoreCommand::GetUserInfo { user } => {
                out.send_peer(&user, PeerMessage::UserInfoRequest, TextEncoding::Utf8);
            }
            CoreCommand::WatchUser { user } => {
                if self.env.users.watch(&user) {
                    out.send_server(ServerRequest::WatchUser { user });
                }
            }
            CoreCommand::SendPeer { user, message } => {
                out.send_peer(&user, message, TextEncoding::Utf8);
            }
            CoreCommand::SetDownloadFilters(patterns) => {
                if let Err(e) = self.downloads.set_filters(&patterns) {
                    warn!(error = %e, "download filters rejected");
                } else {
                    self.config.transfers.download_filters = patterns;
                }
            }
            CoreCommand::UpdateTransferConfig(transfers) => {
                self.downloads.set_config(&transfers);
                self.uploads.set_config(&transfers);
                self.config.transfers = transfers;
                let mut ctx = self.env.ctx(now);
                self.uploads.check_queue(&mut ctx, &mut out);
            }
            CoreCommand::Shutdown => self.begin_shutdown(now, &mut out),
        }
        self.flush(out)
    }

    /// Refuses new uploads, saves the transfer lists and stops the engine.
    fn begin_shutdown(&mut self, now: Instant, out: &mut Outbox) {
        info!("shutting down");
        self.env.shutting_down = true;
        self.dirty = true;
        self.save(now);
        out.command(NetCommand::DisconnectServer);
        out.command(NetCommand::Shutdown);
    }

    // ========================================================================
    // Timers and persistence
    // ========================================================================

    /// Fires due queue timers and saves changed transfer lists now and then.
    pub fn poll(&mut self, now: Instant) -> Vec<NetCommand> {
        let mut out = Outbox::new();
        {
            let mut ctx = self.env.ctx(now);
            self.downloads.poll(&ctx, &mut out);
            self.uploads.poll(&mut ctx, &mut out);
        }
        let commands = self.flush(out);
        if now.saturating_duration_since(self.last_save) >= TRANSFER_SAVE_INTERVAL {
            self.save(now);
        }
        commands
    }

    /// Writes both transfer lists if anything changed since the last save.
    pub fn save(&mut self, now: Instant) {
        if !self.dirty {
            return;
        }
        let Some(store) = self.store.clone() else {
            self.dirty = false;
            return;
        };
        let result = store
            .save(TransferKind::Download, &self.downloads.records())
            .and_then(|()| store.save(TransferKind::Upload, &self.uploads.records()));
        match result {
            Ok(()) => self.dirty = false,
            Err(e) => warn!(error = %e, "cannot save transfer lists"),
        }
        self.last_save = now;
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Runs until the engine's event channel closes or a shutdown completes.
    pub async fn run(
        mut self,
        net: NetHandle,
        mut net_events: mpsc::UnboundedReceiver<NetEvent>,
        mut commands: mpsc::UnboundedReceiver<CoreCommand>,
    ) {
        let mut tick = interval(CORE_TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            let (outgoing, stop) = tokio::select! {
                event = net_events.recv() => match event {
                    Some(event) => (self.on_net_event(event, Instant::now()), false),
                    None => (Vec::new(), true),
                },
                command = commands.recv() => match command {
                    Some(CoreCommand::Connect) => (self.connect().await, false),
                    Some(CoreCommand::Shutdown) | None => {
                        (self.on_command(CoreCommand::Shutdown, Instant::now()), true)
                    }
                    Some(command) => (self.on_command(command, Instant::now()), false),
                },
                _ = tick.tick() => (self.poll(Instant::now()), false),
            };

            for command in outgoing {
                if net.send(command).is_err() {
                    debug!("network engine stopped");
                    self.save(Instant::now());
                    return;
                }
            }
            if stop {
                break;
            }
        }

        self.save(Instant::now());
        info!("core stopped");
    }

    async fn connect(&mut self) -> Vec<NetCommand> {
        let address = self.config.server_address();
        let resolved = match lookup_host(address.as_str()).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!(%address, error = %e, "cannot resolve server");
                None
            }
        };
        let Some(addr) = resolved else {
            self.publish(CoreEvent::ConnectFailed {
                error: format!("cannot resolve {}", address),
            });
            return Vec::new();
        };

        self.env.shutting_down = false;
        info!(%addr, user = %self.config.server.username, "connecting to server");
        vec![NetCommand::ConnectServer {
            addr,
            username: self.config.server.username.clone(),
            password: self.config.server.password.clone(),
            listen_port: self.config.network.listen_port,
        }]
    }
}

#[cfg(test)]
mod tests;
