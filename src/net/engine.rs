//! The socket multiplexer.
//!
//! [`NetworkEngine`] is the only owner of sockets. It runs as one task on a
//! current-thread runtime: every iteration waits for socket readiness, a
//! command, an accepted or finished connect, a housekeeping tick, or a short
//! timeout, then does one read and/or write per ready socket.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BufMut};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::connection::{ConnId, Connection, ConnectionRole, FileStage};
use super::error::NetError;
use super::event::{CloseReason, ConnectionStats, NetCommand, NetEvent};
use super::router::{Action, ConnectIntent, Outgoing, PeerRouter};
use super::shaper::{DownloadLimiter, UploadShaper};
use crate::config::NetworkConfig;
use crate::constants::{
    CLIENT_MINOR_VERSION, CLIENT_VERSION, CONNECTION_MAX_IDLE, CONNECT_TIMEOUT, LOOP_TIMEOUT,
    PROGRESS_INTERVAL, SERVER_PING_INTERVAL, STATS_INTERVAL,
};
use crate::protocol::{
    FileOffset, FileTransferInit, Message, PeerInit, ServerRequest, ServerResponse,
};

type ConnectOutcome = (Target, SocketAddr, io::Result<TcpStream>);
type ConnectFuture = Pin<Box<dyn Future<Output = ConnectOutcome> + Send>>;

#[derive(Debug)]
enum Target {
    Server {
        username: String,
        password: String,
        listen_port: u16,
    },
    Peer(ConnectIntent),
}

enum Wake {
    Ready(Vec<(ConnId, io::Result<Ready>)>),
    Command(Option<NetCommand>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Connected(Target, SocketAddr, io::Result<TcpStream>),
    Ping,
    Housekeeping,
    Timeout,
}

struct Slot {
    stream: TcpStream,
    conn: Connection,
}

/// Cloneable handle for talking to a running [`NetworkEngine`].
#[derive(Debug, Clone)]
pub struct NetHandle {
    commands: mpsc::UnboundedSender<NetCommand>,
    stats: Arc<Mutex<ConnectionStats>>,
}

impl NetHandle {
    pub fn send(&self, command: NetCommand) -> Result<(), NetError> {
        self.commands
            .send(command)
            .map_err(|_| NetError::EngineStopped)
    }

    /// Latest connection statistics, readable from any thread.
    pub fn stats(&self) -> ConnectionStats {
        *self.stats.lock()
    }
}

/// Owns every socket and turns bytes into [`NetEvent`]s.
pub struct NetworkEngine {
    listener: Option<TcpListener>,
    commands: mpsc::UnboundedReceiver<NetCommand>,
    events: mpsc::UnboundedSender<NetEvent>,
    stats: Arc<Mutex<ConnectionStats>>,
    slots: HashMap<ConnId, Slot>,
    connecting: FuturesUnordered<ConnectFuture>,
    next_id: u64,
    server: Option<ConnId>,
    router: PeerRouter,
    shaper: UploadShaper,
    download_limiter: DownloadLimiter,
    max_sockets: usize,
    downloaded: u64,
    uploaded: u64,
    last_stats: Instant,
    running: bool,
}

impl NetworkEngine {
    pub fn new(
        config: &NetworkConfig,
        listener: Option<TcpListener>,
    ) -> (Self, NetHandle, mpsc::UnboundedReceiver<NetEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(ConnectionStats::default()));
        let now = clock();

        let engine = Self {
            listener,
            commands: command_rx,
            events: event_tx,
            stats: stats.clone(),
            slots: HashMap::new(),
            connecting: FuturesUnordered::new(),
            next_id: 0,
            server: None,
            router: PeerRouter::new(),
            shaper: UploadShaper::new(config.upload_limit, config.upload_policy, now),
            download_limiter: DownloadLimiter::new(config.download_limit, now),
            max_sockets: config.max_sockets,
            downloaded: 0,
            uploaded: 0,
            last_stats: now,
            running: true,
        };
        let handle = NetHandle {
            commands: command_tx,
            stats,
        };
        (engine, handle, event_rx)
    }

    /// Runs until [`NetCommand::Shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        let mut ping = interval(SERVER_PING_INTERVAL);
        let mut housekeeping = interval(STATS_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        ping.tick().await;
        housekeeping.tick().await;

        if let Some(addr) = self.listener.as_ref().and_then(|l| l.local_addr().ok()) {
            info!("listening for peers on {}", addr);
        }

        while self.running {
            self.shaper.begin_pass(clock());
            let wake = self.wait(&mut ping, &mut housekeeping).await;
            let now = clock();

            match wake {
                Wake::Ready(ready) => {
                    for (id, result) in ready {
                        self.on_ready(id, result, now);
                    }
                }
                Wake::Command(Some(command)) => {
                    self.handle_command(command, now);
                    while let Ok(command) = self.commands.try_recv() {
                        self.handle_command(command, now);
                    }
                }
                Wake::Command(None) => {
                    debug!("all engine handles dropped");
                    self.shutdown(now);
                }
                Wake::Accepted(result) => self.on_accepted(result, now),
                Wake::Connected(target, addr, result) => {
                    self.on_connected(target, addr, result, now)
                }
                Wake::Ping => self.send_server(ServerRequest::ServerPing),
                Wake::Housekeeping => self.housekeeping(now),
                Wake::Timeout => {}
            }
        }

        info!("network engine stopped");
    }

    async fn wait(&mut self, ping: &mut Interval, housekeeping: &mut Interval) -> Wake {
        let now = clock();
        let mut interests = Vec::with_capacity(self.slots.len());
        for (id, slot) in &self.slots {
            let conn = &slot.conn;
            let mut interest = None;

            let throttled = conn.is_download() && self.download_limiter.budget(now) == 0;
            if !throttled {
                interest = Some(Interest::READABLE);
            }

            let wants_write = conn.has_pending_output()
                || matches!(&conn.file, Some(FileStage::Uploading(u)) if u.offset < u.size);
            if wants_write && (!conn.is_upload() || self.shaper.budget(*id, now) > 0) {
                interest = Some(match interest {
                    Some(i) => i | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }

            if let Some(interest) = interest {
                interests.push((*id, interest));
            }
        }

        let Self {
            slots,
            commands,
            listener,
            connecting,
            ..
        } = self;
        let slots = &*slots;

        let mut ready: FuturesUnordered<_> = interests
            .into_iter()
            .filter_map(|(id, interest)| {
                let slot = slots.get(&id)?;
                Some(async move { (id, slot.stream.ready(interest).await) })
            })
            .collect();

        tokio::select! {
            Some(first) = ready.next() => {
                let mut all = vec![first];
                while let Some(Some(more)) = ready.next().now_or_never() {
                    all.push(more);
                }
                Wake::Ready(all)
            }
            command = commands.recv() => Wake::Command(command),
            accepted = accept(listener.as_ref()) => Wake::Accepted(accepted),
            Some((target, addr, result)) = connecting.next() => {
                Wake::Connected(target, addr, result)
            }
            _ = ping.tick() => Wake::Ping,
            _ = housekeeping.tick() => Wake::Housekeeping,
            _ = sleep(LOOP_TIMEOUT) => Wake::Timeout,
        }
    }

    fn emit(&self, event: NetEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn socket_count(&self) -> usize {
        self.slots.len() + self.connecting.len() + usize::from(self.listener.is_some())
    }

    fn insert(&mut self, stream: TcpStream, make: impl FnOnce(ConnId) -> Connection) -> ConnId {
        self.next_id += 1;
        let id = ConnId(self.next_id);
        let _ = stream.set_nodelay(true);
        self.slots.insert(
            id,
            Slot {
                stream,
                conn: make(id),
            },
        );
        id
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: NetCommand, now: Instant) {
        match command {
            NetCommand::ConnectServer {
                addr,
                username,
                password,
                listen_port,
            } => {
                if let Some(server) = self.server {
                    self.close(server, CloseReason::Local, now);
                }
                info!("connecting to server {}", addr);
                let target = Target::Server {
                    username,
                    password,
                    listen_port,
                };
                if let Err(e) = self.start_connect(target, addr) {
                    self.emit(NetEvent::ServerConnectFailed {
                        addr,
                        error: e.to_string(),
                    });
                }
            }
            NetCommand::DisconnectServer => {
                if let Some(server) = self.server {
                    self.close(server, CloseReason::Local, now);
                }
            }
            NetCommand::SendServer(request) => self.send_server(request),
            NetCommand::SendPeer {
                user,
                message,
                encoding,
            } => {
                let actions = self.router.send(&user, message, encoding, now);
                self.apply(actions, now);
            }
            NetCommand::InitFileTransfer { user, token } => {
                let actions = self.router.open_file_connection(&user, token, now);
                self.apply(actions, now);
            }
            NetCommand::AttachDownload {
                conn,
                token,
                file,
                offset,
                size,
            } => self.attach_download(conn, token, file, offset, size, now),
            NetCommand::AttachUpload {
                conn,
                token,
                file,
                size,
            } => self.attach_upload(conn, token, file, size, now),
            NetCommand::CloseConnection(conn) => self.close(conn, CloseReason::Local, now),
            NetCommand::SetUploadLimit { limit, policy } => {
                debug!(limit, ?policy, "upload limit changed");
                self.shaper.set_limit(limit, policy, now);
            }
            NetCommand::SetDownloadLimit { limit } => {
                debug!(limit, "download limit changed");
                self.download_limiter.set_limit(limit, now);
            }
            NetCommand::Shutdown => self.shutdown(now),
        }
    }

    fn shutdown(&mut self, now: Instant) {
        let ids: Vec<ConnId> = self.slots.keys().copied().collect();
        for id in ids {
            self.close(id, CloseReason::Local, now);
        }
        self.connecting = FuturesUnordered::new();
        self.running = false;
    }

    fn send_server(&mut self, request: ServerRequest) {
        let Some(slot) = self.server.and_then(|id| self.slots.get_mut(&id)) else {
            debug!(?request, "not connected to server, dropping request");
            return;
        };
        slot.conn.queue_bytes(&request.encode());
    }

    fn attach_download(
        &mut self,
        id: ConnId,
        token: u32,
        file: std::fs::File,
        offset: u64,
        size: u64,
        now: Instant,
    ) {
        let Some(slot) = self.slots.get_mut(&id) else {
            debug!(conn = %id, token, "download connection gone before attach");
            return;
        };
        let conn = &mut slot.conn;
        let expected = matches!(
            conn.file,
            Some(FileStage::AwaitingAttachDownload { token: t }) if t == token
        );
        if !expected {
            warn!(conn = %id, token, "attach download on connection in wrong state");
            return;
        }

        conn.queue_bytes(&FileOffset { offset }.encode());
        conn.start_download(token, file, offset, size, now);
        debug!(conn = %id, token, offset, size, "download attached");

        // Bytes that arrived before the attach belong to the file
        self.process_inbound(id, now);
    }

    fn attach_upload(
        &mut self,
        id: ConnId,
        token: u32,
        mut file: std::fs::File,
        size: u64,
        now: Instant,
    ) {
        let Some(slot) = self.slots.get_mut(&id) else {
            debug!(conn = %id, token, "upload connection gone before attach");
            return;
        };
        let conn = &mut slot.conn;
        let offset = match conn.file {
            Some(FileStage::AwaitingAttachUpload { token: t, offset }) if t == token => offset,
            _ => {
                warn!(conn = %id, token, "attach upload on connection in wrong state");
                return;
            }
        };
        let user = conn.user.clone().unwrap_or_default();

        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            self.emit(NetEvent::UploadFileError {
                user,
                token,
                error: e.to_string(),
            });
            self.close(id, CloseReason::Error, now);
            return;
        }

        conn.start_upload(token, file, offset, size, now);
        self.shaper.register(id, now);
        debug!(conn = %id, token, offset, size, "upload attached");
    }

    // ------------------------------------------------------------------
    // Connection setup
    // ------------------------------------------------------------------

    fn start_connect(&mut self, target: Target, addr: SocketAddr) -> Result<(), NetError> {
        if self.socket_count() >= self.max_sockets {
            return Err(NetError::SocketLimit(self.max_sockets));
        }

        self.connecting.push(Box::pin(async move {
            let result = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            (target, addr, result)
        }));
        Ok(())
    }

    fn on_accepted(&mut self, result: io::Result<(TcpStream, SocketAddr)>, now: Instant) {
        match result {
            Ok((stream, addr)) => {
                if self.socket_count() >= self.max_sockets {
                    debug!(%addr, "socket limit reached, dropping incoming connection");
                    return;
                }
                let id = self.insert(stream, |id| Connection::incoming(id, addr, now));
                debug!(conn = %id, %addr, "incoming connection");
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }

    fn on_connected(
        &mut self,
        target: Target,
        addr: SocketAddr,
        result: io::Result<TcpStream>,
        now: Instant,
    ) {
        match (target, result) {
            (
                Target::Server {
                    username,
                    password,
                    listen_port,
                },
                Ok(stream),
            ) => {
                let id = self.insert(stream, |id| Connection::server(id, addr, now));
                self.server = Some(id);
                self.router.set_username(&username);
                self.send_server(ServerRequest::Login {
                    username,
                    password,
                    version: CLIENT_VERSION,
                    minor_version: CLIENT_MINOR_VERSION,
                });
                self.send_server(ServerRequest::SetWaitPort {
                    port: u32::from(listen_port),
                });
                info!("connected to server {}", addr);
                self.emit(NetEvent::ServerConnected { addr });
            }
            (Target::Server { .. }, Err(e)) => {
                warn!("cannot connect to server {}: {}", addr, e);
                self.emit(NetEvent::ServerConnectFailed {
                    addr,
                    error: e.to_string(),
                });
            }
            (Target::Peer(intent), Ok(stream)) => {
                let id = self.insert(stream, |id| Connection::outgoing(id, addr, now));
                let actions = match intent {
                    ConnectIntent::Direct { token } => self.router.on_direct_connected(token, id),
                    ConnectIntent::Pierce {
                        user,
                        conn_type,
                        token,
                    } => self.router.on_pierce_connected(id, &user, conn_type, token),
                };
                self.apply(actions, now);
            }
            (Target::Peer(intent), Err(e)) => {
                debug!(%addr, "peer connect failed: {}", e);
                let actions = self.connect_failed(intent);
                self.apply(actions, now);
            }
        }
    }

    fn connect_failed(&mut self, intent: ConnectIntent) -> Vec<Action> {
        match intent {
            ConnectIntent::Direct { token } => self.router.on_direct_failed(token),
            ConnectIntent::Pierce { user, token, .. } => self.router.on_pierce_failed(&user, token),
        }
    }

    fn apply(&mut self, actions: Vec<Action>, now: Instant) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Connect { addr, intent } => {
                    let target = Target::Peer(intent.clone());
                    if let Err(e) = self.start_connect(target, addr) {
                        debug!("cannot open peer connection: {}", e);
                        queue.extend(self.connect_failed(intent));
                    }
                }
                Action::SendServer(request) => self.send_server(request),
                Action::Bind {
                    conn,
                    user,
                    conn_type,
                } => {
                    let Some(slot) = self.slots.get_mut(&conn) else {
                        continue;
                    };
                    slot.conn.bind(&user, conn_type);
                    let addr = slot.conn.addr;
                    debug!(%conn, %user, conn_type = conn_type.as_str(), "peer connection bound");
                    self.emit(NetEvent::PeerConnected {
                        conn,
                        user,
                        conn_type,
                        addr,
                    });
                }
                Action::Write { conn, out } => self.write_outgoing(conn, out),
                Action::Close(conn) => self.close(conn, CloseReason::Local, now),
                Action::Emit(event) => self.emit(event),
            }
        }
    }

    fn write_outgoing(&mut self, id: ConnId, out: Outgoing) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let conn = &mut slot.conn;
        match out {
            Outgoing::Init(init) => conn.queue_init(init),
            Outgoing::Peer(message, encoding) => match message.encode_with(encoding) {
                Ok(bytes) => conn.queue_peer_message(message, &bytes),
                Err(e) => warn!(conn = %id, "cannot encode {:?}: {}", message.code(), e),
            },
            Outgoing::FileTransferInit(token) => {
                conn.queue_bytes(&FileTransferInit { token }.encode());
                conn.file = Some(FileStage::AwaitingOffset { token });
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket I/O
    // ------------------------------------------------------------------

    fn on_ready(&mut self, id: ConnId, result: io::Result<Ready>, now: Instant) {
        let ready = match result {
            Ok(ready) => ready,
            Err(e) => {
                debug!(conn = %id, "socket error: {}", e);
                self.close(id, CloseReason::Error, now);
                return;
            }
        };

        if ready.is_readable() || ready.is_read_closed() {
            self.read_socket(id, now);
        }
        if ready.is_writable() && self.slots.contains_key(&id) {
            self.write_socket(id, now);
        }
    }

    fn read_socket(&mut self, id: ConnId, now: Instant) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let is_download = slot.conn.is_download();
        let mut want = slot.conn.read_len();
        if is_download {
            want = want.min(self.download_limiter.budget(now));
            if want == 0 {
                return;
            }
        }

        slot.conn.inbound.reserve(want);
        let mut limited = (&mut slot.conn.inbound).limit(want);
        match slot.stream.try_read_buf(&mut limited) {
            Ok(0) => self.close(id, CloseReason::Remote, now),
            Ok(n) => {
                slot.conn.last_active = now;
                if is_download {
                    self.download_limiter.consume(n);
                    self.downloaded += n as u64;
                    slot.conn.adapt_read_len(n);
                }
                self.process_inbound(id, now);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(conn = %id, "read failed: {}", e);
                self.close(id, CloseReason::Error, now);
            }
        }
    }

    fn process_inbound(&mut self, id: ConnId, now: Instant) {
        loop {
            let Some(slot) = self.slots.get_mut(&id) else {
                return;
            };
            if slot.conn.is_download() {
                self.drain_download(id, now);
                return;
            }

            match slot.conn.next_message() {
                Ok(Some(message)) => self.handle_message(id, message, now),
                Ok(None) => return,
                Err(e) => {
                    warn!(conn = %id, addr = %slot.conn.addr, "malformed data: {}", e);
                    self.close(id, CloseReason::Malformed, now);
                    return;
                }
            }
        }
    }

    fn drain_download(&mut self, id: ConnId, now: Instant) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let conn = &mut slot.conn;
        let user = conn.user.clone().unwrap_or_default();
        let Some(FileStage::Downloading(d)) = conn.file.as_mut() else {
            return;
        };

        let mut events = Vec::new();
        let mut close = None;
        let take = d.size.saturating_sub(d.offset).min(conn.inbound.len() as u64) as usize;

        if take > 0 {
            match d.file.write_all(&conn.inbound[..take]) {
                Ok(()) => {
                    d.offset += take as u64;
                    conn.inbound.advance(take);
                }
                Err(e) => {
                    events.push(NetEvent::DownloadFileError {
                        user: user.clone(),
                        token: d.token,
                        error: e.to_string(),
                    });
                    close = Some(CloseReason::Error);
                }
            }
        }

        if close.is_none() {
            let complete = d.offset >= d.size;
            if complete || now.saturating_duration_since(d.last_progress) >= PROGRESS_INTERVAL {
                d.last_progress = now;
                events.push(NetEvent::DownloadProgress {
                    user,
                    token: d.token,
                    offset: d.offset,
                });
            }
            if complete {
                close = Some(CloseReason::Complete);
            }
        }

        for event in events {
            self.emit(event);
        }
        if let Some(reason) = close {
            self.close(id, reason, now);
        }
    }

    fn handle_message(&mut self, id: ConnId, message: Message, now: Instant) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let user = slot.conn.user.clone().unwrap_or_default();

        match message {
            Message::FromServer(response) => {
                let actions = match &response {
                    ServerResponse::PeerAddress { user, ip, port } => {
                        self.router.on_peer_address(user, *ip, *port, now)
                    }
                    ServerResponse::ConnectToPeer {
                        user,
                        conn_type,
                        ip,
                        port,
                        token,
                        ..
                    } => self
                        .router
                        .on_connect_request(user, *conn_type, *ip, *port, *token),
                    ServerResponse::CantConnectToPeer { token } => {
                        self.router.on_cant_connect(*token)
                    }
                    _ => Vec::new(),
                };
                self.apply(actions, now);
                self.emit(NetEvent::ServerMessage(response));
            }
            Message::Init(PeerInit::PierceFirewall { token }) => {
                let actions = self.router.on_incoming_pierce(id, token);
                self.apply(actions, now);
            }
            Message::Init(PeerInit::PeerInit {
                username,
                conn_type,
                ..
            }) => {
                debug!(
                    conn = %id,
                    user = %username,
                    conn_type = conn_type.as_str(),
                    "incoming peer init"
                );
                let actions = self.router.on_incoming_peer_init(id, &username, conn_type);
                self.apply(actions, now);
            }
            Message::Peer(message) => self.emit(NetEvent::PeerMessage {
                conn: id,
                user,
                message,
            }),
            Message::Distributed(message) => self.emit(NetEvent::DistributedMessage {
                conn: id,
                user,
                message,
            }),
            Message::FileTransferInit(FileTransferInit { token }) => {
                slot.conn.file = Some(FileStage::AwaitingAttachDownload { token });
                self.emit(NetEvent::DownloadInitReceived {
                    conn: id,
                    user,
                    token,
                });
            }
            Message::FileOffset(FileOffset { offset }) => {
                let Some(FileStage::AwaitingOffset { token }) = slot.conn.file else {
                    return;
                };
                slot.conn.file = Some(FileStage::AwaitingAttachUpload { token, offset });
                self.emit(NetEvent::UploadOffsetReceived {
                    conn: id,
                    user,
                    token,
                    offset,
                });
            }
            Message::ToServer(request) => {
                debug!(conn = %id, ?request, "ignoring client message from remote");
            }
        }
    }

    fn write_socket(&mut self, id: ConnId, now: Instant) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let conn = &mut slot.conn;
        let user = conn.user.clone().unwrap_or_default();
        let mut events = Vec::new();
        let mut close = None;

        let mut budget = usize::MAX;
        if conn.is_upload() {
            budget = self.shaper.budget(id, now);
            let read_ahead = self.shaper.read_ahead(id, budget);
            let buffered = conn.outbound.len();

            let mut chunk = Vec::new();
            let mut read = Ok(0);
            if let Some(FileStage::Uploading(u)) = conn.file.as_mut() {
                let remaining = u.size.saturating_sub(u.offset);
                let want = (read_ahead.saturating_sub(buffered) as u64).min(remaining) as usize;
                if want > 0 {
                    chunk.resize(want, 0);
                    read = match u.file.read(&mut chunk) {
                        Ok(0) => Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file is shorter than announced",
                        )),
                        other => other,
                    };
                }
                match &read {
                    Ok(n) => u.offset += *n as u64,
                    Err(e) => {
                        events.push(NetEvent::UploadFileError {
                            user: user.clone(),
                            token: u.token,
                            error: e.to_string(),
                        });
                        close = Some(CloseReason::Error);
                    }
                }
            }
            if let Ok(n) = read {
                conn.queue_bytes(&chunk[..n]);
            }
        }

        let len = conn.outbound.len().min(budget);
        if close.is_none() && len > 0 {
            match slot.stream.try_write(&conn.outbound[..len]) {
                Ok(written) => {
                    conn.on_written(written);
                    conn.last_active = now;
                    if conn.is_upload() {
                        self.shaper.consume(id, written, now);
                        self.uploaded += written as u64;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(conn = %id, "write failed: {}", e);
                    close = Some(CloseReason::Error);
                }
            }
        }

        if close.is_none() {
            let written = conn.upload_written();
            if let (Some(written), Some(FileStage::Uploading(u))) = (written, conn.file.as_mut()) {
                let complete = written >= u.size;
                if complete || now.saturating_duration_since(u.last_progress) >= PROGRESS_INTERVAL {
                    u.last_progress = now;
                    events.push(NetEvent::UploadProgress {
                        user,
                        token: u.token,
                        offset: written,
                        speed: self.shaper.rate(id),
                    });
                }
            }
        }

        for event in events {
            self.emit(event);
        }
        if let Some(reason) = close {
            self.close(id, reason, now);
        }
    }

    // ------------------------------------------------------------------
    // Teardown and housekeeping
    // ------------------------------------------------------------------

    fn close(&mut self, id: ConnId, reason: CloseReason, now: Instant) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        let mut conn = slot.conn;
        drop(slot.stream);
        self.router.on_closed(id);
        self.shaper.unregister(id);

        let undelivered = conn.take_undelivered();
        let user = conn.user.clone();
        let upload_written = conn.upload_written();
        debug!(conn = %id, ?reason, user = ?user, role = ?conn.role, "connection closed");

        // Release the file handle before anyone reacts to the close
        if let Some(stage) = conn.file.take() {
            let user = user.clone().unwrap_or_default();
            match stage {
                FileStage::Downloading(d) => {
                    let offset = d.offset;
                    let token = d.token;
                    drop(d);
                    self.emit(NetEvent::DownloadConnectionClosed { user, token, offset });
                }
                FileStage::AwaitingAttachDownload { token } => {
                    self.emit(NetEvent::DownloadConnectionClosed {
                        user,
                        token,
                        offset: 0,
                    });
                }
                FileStage::Uploading(u) => {
                    let offset = upload_written.unwrap_or(0);
                    let timed_out = reason == CloseReason::Idle && offset < u.size;
                    let token = u.token;
                    drop(u);
                    self.emit(NetEvent::UploadConnectionClosed {
                        user,
                        token,
                        offset,
                        timed_out,
                    });
                }
                FileStage::AwaitingOffset { token }
                | FileStage::AwaitingAttachUpload { token, .. } => {
                    self.emit(NetEvent::UploadConnectionClosed {
                        user,
                        token,
                        offset: 0,
                        timed_out: reason == CloseReason::Idle,
                    });
                }
                FileStage::AwaitingToken => {}
            }
        }

        self.emit(NetEvent::ConnectionClosed {
            conn: id,
            user,
            role: conn.role,
            reason,
            undelivered,
        });

        if self.server == Some(id) {
            self.server = None;
            info!("disconnected from server");
            let others: Vec<ConnId> = self.slots.keys().copied().collect();
            for other in others {
                self.close(other, CloseReason::Local, now);
            }
            self.connecting = FuturesUnordered::new();
            self.router.reset();
            self.emit(NetEvent::ServerDisconnected);
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let actions = self.router.expire(now);
        self.apply(actions, now);

        let at_limit = self.socket_count() >= self.max_sockets;
        let stale: Vec<ConnId> = self
            .slots
            .values()
            .filter(|slot| !slot.conn.is_server())
            .filter(|slot| {
                let idle =
                    now.saturating_duration_since(slot.conn.last_active) >= CONNECTION_MAX_IDLE;
                let quiet_peer = slot.conn.role == Some(ConnectionRole::Peer)
                    && slot.conn.inbound.is_empty()
                    && !slot.conn.has_pending_output();
                idle || (at_limit && quiet_peer)
            })
            .map(|slot| slot.conn.id)
            .collect();
        for id in stale {
            self.close(id, CloseReason::Idle, now);
        }

        let elapsed = now.saturating_duration_since(self.last_stats).as_secs_f64().max(0.001);
        let stats = ConnectionStats {
            connections: self.slots.len(),
            download_connections: self.slots.values().filter(|s| s.conn.is_download()).count(),
            upload_connections: self.slots.values().filter(|s| s.conn.is_upload()).count(),
            download_speed: (self.downloaded as f64 / elapsed) as u64,
            upload_speed: (self.uploaded as f64 / elapsed) as u64,
        };
        self.downloaded = 0;
        self.uploaded = 0;
        self.last_stats = now;
        *self.stats.lock() = stats;
        self.emit(NetEvent::Stats(stats));
    }
}

/// Current time on the runtime clock, so paused test runtimes drive timeouts.
fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
