//! Socket-less connection state.
//!
//! A [`Connection`] holds everything the engine knows about one socket except
//! the socket itself: its role, buffered bytes in both directions, the init
//! handshake and, for "F" connections, the file transfer stage. Keeping the
//! socket out makes the framing and bookkeeping testable without a network.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::constants::{CONTROL_READ_SIZE, INITIAL_DOWNLOAD_READ, MAX_DOWNLOAD_READ};
use crate::protocol::{
    decode, ConnectionType, Decoded, FrameKind, Message, PeerInit, PeerMessage, ProtocolError,
};

/// Opaque handle of a connection owned by the network engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Server,
    Peer,
    File,
    Distributed,
}

impl From<ConnectionType> for ConnectionRole {
    fn from(conn_type: ConnectionType) -> Self {
        match conn_type {
            ConnectionType::Peer => ConnectionRole::Peer,
            ConnectionType::File => ConnectionRole::File,
            ConnectionType::Distributed => ConnectionRole::Distributed,
        }
    }
}

/// First messages exchanged on a peer socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeState {
    pub sent: Option<PeerInit>,
    pub received: Option<PeerInit>,
    /// A ConnectToPeer request was sent to the server for this connection.
    pub indirect_requested: bool,
    pub token: u32,
}

/// Progress of an "F" connection.
#[derive(Debug)]
pub(crate) enum FileStage {
    /// Waiting for the uploader to name its transfer token.
    AwaitingToken,
    /// Token received, waiting for the owner to attach the download file.
    AwaitingAttachDownload { token: u32 },
    /// Token sent, waiting for the downloader's resume offset.
    AwaitingOffset { token: u32 },
    /// Offset received, waiting for the owner to attach the upload file.
    AwaitingAttachUpload { token: u32, offset: u64 },
    Downloading(Download),
    Uploading(Upload),
}

#[derive(Debug)]
pub(crate) struct Download {
    pub token: u32,
    pub file: File,
    pub size: u64,
    pub offset: u64,
    pub read_len: usize,
    pub last_progress: Instant,
}

#[derive(Debug)]
pub(crate) struct Upload {
    pub token: u32,
    pub file: File,
    pub size: u64,
    /// Read position in the file. Bytes on the wire are `offset` minus
    /// whatever still sits in the outbound buffer.
    pub offset: u64,
    pub last_progress: Instant,
}

impl FileStage {
    pub fn token(&self) -> Option<u32> {
        match self {
            FileStage::AwaitingToken => None,
            FileStage::AwaitingAttachDownload { token }
            | FileStage::AwaitingOffset { token }
            | FileStage::AwaitingAttachUpload { token, .. } => Some(*token),
            FileStage::Downloading(d) => Some(d.token),
            FileStage::Uploading(u) => Some(u.token),
        }
    }
}

/// State of one socket owned by the engine.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub addr: SocketAddr,
    /// `None` until the first init message of an incoming socket is decoded.
    pub role: Option<ConnectionRole>,
    pub user: Option<String>,
    pub handshake: Option<HandshakeState>,
    pub last_active: Instant,
    pub(crate) inbound: BytesMut,
    pub(crate) outbound: BytesMut,
    pub(crate) file: Option<FileStage>,
    /// Peer messages not yet fully written, keyed by the cumulative outbound
    /// byte count at which they end.
    unsent: VecDeque<(u64, PeerMessage)>,
    queued_total: u64,
    written_total: u64,
}

impl Connection {
    fn new(id: ConnId, addr: SocketAddr, role: Option<ConnectionRole>, now: Instant) -> Self {
        Self {
            id,
            addr,
            role,
            user: None,
            handshake: None,
            last_active: now,
            inbound: BytesMut::with_capacity(CONTROL_READ_SIZE),
            outbound: BytesMut::new(),
            file: None,
            unsent: VecDeque::new(),
            queued_total: 0,
            written_total: 0,
        }
    }

    pub fn server(id: ConnId, addr: SocketAddr, now: Instant) -> Self {
        Self::new(id, addr, Some(ConnectionRole::Server), now)
    }

    /// A socket accepted on the listener, role unknown yet.
    pub fn incoming(id: ConnId, addr: SocketAddr, now: Instant) -> Self {
        let mut conn = Self::new(id, addr, None, now);
        conn.handshake = Some(HandshakeState::default());
        conn
    }

    /// A socket we opened to a peer. The role is bound by the router.
    pub fn outgoing(id: ConnId, addr: SocketAddr, now: Instant) -> Self {
        let mut conn = Self::new(id, addr, None, now);
        conn.handshake = Some(HandshakeState::default());
        conn
    }

    /// Binds the connection to a user and purpose.
    pub fn bind(&mut self, user: &str, conn_type: ConnectionType) {
        self.role = Some(conn_type.into());
        self.user = Some(user.to_string());
        if conn_type == ConnectionType::File && self.file.is_none() {
            self.file = Some(FileStage::AwaitingToken);
        }
    }

    pub fn is_server(&self) -> bool {
        self.role == Some(ConnectionRole::Server)
    }

    pub fn is_download(&self) -> bool {
        matches!(self.file, Some(FileStage::Downloading(_)))
    }

    pub fn is_upload(&self) -> bool {
        matches!(self.file, Some(FileStage::Uploading(_)))
    }

    pub fn file_token(&self) -> Option<u32> {
        self.file.as_ref().and_then(FileStage::token)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Records a PeerInit or PierceFirewall we are about to send.
    pub fn queue_init(&mut self, init: PeerInit) {
        self.queue_bytes(&init.encode());
        if let Some(handshake) = self.handshake.as_mut() {
            if let PeerInit::PierceFirewall { token } = init {
                handshake.token = token;
            }
            handshake.sent = Some(init);
        }
    }

    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
        self.queued_total += bytes.len() as u64;
    }

    /// Queues an encoded peer message and remembers it until its last byte
    /// has been written.
    pub fn queue_peer_message(&mut self, message: PeerMessage, bytes: &[u8]) {
        self.queue_bytes(bytes);
        self.unsent.push_back((self.queued_total, message));
    }

    /// Drops `n` written bytes from the outbound buffer.
    pub fn on_written(&mut self, n: usize) {
        self.outbound.advance(n);
        self.written_total += n as u64;
        while let Some((end, _)) = self.unsent.front() {
            if *end > self.written_total {
                break;
            }
            self.unsent.pop_front();
        }
    }

    /// Peer messages that never fully reached the socket.
    pub fn take_undelivered(&mut self) -> Vec<PeerMessage> {
        self.unsent.drain(..).map(|(_, message)| message).collect()
    }

    /// How much to read from the socket next.
    pub fn read_len(&self) -> usize {
        match &self.file {
            Some(FileStage::Downloading(d)) => d.read_len,
            _ => CONTROL_READ_SIZE,
        }
    }

    /// Grows the download read size when a read filled at least half of it.
    pub fn adapt_read_len(&mut self, read: usize) {
        if let Some(FileStage::Downloading(d)) = self.file.as_mut() {
            if read >= d.read_len / 2 {
                d.read_len = (d.read_len * 2).min(MAX_DOWNLOAD_READ);
            }
        }
    }

    /// The frame kind the next inbound bytes are decoded with, or `None` when
    /// they are raw file content or nothing is expected.
    pub fn expected_frame(&self) -> Option<FrameKind> {
        match self.role {
            None => Some(FrameKind::PeerInit),
            Some(ConnectionRole::Server) => Some(FrameKind::Server),
            Some(ConnectionRole::Peer) => Some(FrameKind::Peer),
            Some(ConnectionRole::Distributed) => Some(FrameKind::Distributed),
            Some(ConnectionRole::File) => match self.file {
                Some(FileStage::AwaitingToken) => Some(FrameKind::FileTransferInit),
                Some(FileStage::AwaitingOffset { .. }) => Some(FrameKind::FileOffset),
                _ => None,
            },
        }
    }

    /// Decodes the next complete message from the inbound buffer.
    ///
    /// Messages with unknown codes are skipped. The role may change after a
    /// returned message, so callers decode one message at a time.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            let Some(kind) = self.expected_frame() else {
                return Ok(None);
            };
            match decode(kind, &self.inbound)? {
                Decoded::NeedMoreBytes => return Ok(None),
                Decoded::Unsupported { code, consumed } => {
                    debug!(conn = %self.id, ?kind, code, "skipping unsupported message");
                    self.inbound.advance(consumed);
                }
                Decoded::Malformed {
                    code,
                    consumed,
                    reason,
                } => {
                    warn!(conn = %self.id, ?kind, code, %reason, "dropping malformed message");
                    self.inbound.advance(consumed);
                }
                Decoded::Message(message, consumed) => {
                    self.inbound.advance(consumed);
                    if let (Message::Init(init), Some(handshake)) =
                        (&message, self.handshake.as_mut())
                    {
                        handshake.received = Some(init.clone());
                    }
                    return Ok(Some(message));
                }
            }
        }
    }

    pub(crate) fn start_download(
        &mut self,
        token: u32,
        file: File,
        offset: u64,
        size: u64,
        now: Instant,
    ) {
        self.file = Some(FileStage::Downloading(Download {
            token,
            file,
            size,
            offset,
            read_len: INITIAL_DOWNLOAD_READ,
            last_progress: now,
        }));
    }

    pub(crate) fn start_upload(
        &mut self,
        token: u32,
        file: File,
        offset: u64,
        size: u64,
        now: Instant,
    ) {
        self.file = Some(FileStage::Uploading(Upload {
            token,
            file,
            size,
            offset,
            last_progress: now,
        }));
    }

    /// Bytes of an upload that actually left through the socket.
    pub(crate) fn upload_written(&self) -> Option<u64> {
        match &self.file {
            Some(FileStage::Uploading(u)) => {
                Some(u.offset.saturating_sub(self.outbound.len() as u64))
            }
            _ => None,
        }
    }
}
