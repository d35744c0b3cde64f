use std::fs::File;
use std::net::SocketAddr;

use super::connection::{ConnId, ConnectionRole};
use super::shaper::ShapingPolicy;
use crate::protocol::{
    ConnectionType, DistributedMessage, PeerMessage, ServerRequest, ServerResponse, TextEncoding,
};

/// Requests accepted by the network engine.
///
/// Producers on other tasks or threads never touch sockets; they enqueue one
/// of these and the engine applies it on its next iteration.
#[derive(Debug)]
pub enum NetCommand {
    ConnectServer {
        addr: SocketAddr,
        username: String,
        password: String,
        listen_port: u16,
    },
    DisconnectServer,
    SendServer(ServerRequest),
    SendPeer {
        user: String,
        message: PeerMessage,
        encoding: TextEncoding,
    },
    /// Opens a file connection to `user` and sends the upload token.
    InitFileTransfer { user: String, token: u32 },
    /// Starts receiving a download on a file connection that delivered `token`.
    AttachDownload {
        conn: ConnId,
        token: u32,
        file: File,
        offset: u64,
        size: u64,
    },
    /// Starts streaming `file` on a file connection that delivered its offset.
    AttachUpload {
        conn: ConnId,
        token: u32,
        file: File,
        size: u64,
    },
    CloseConnection(ConnId),
    /// Upload limit in bytes per second, 0 for unlimited.
    SetUploadLimit { limit: u64, policy: ShapingPolicy },
    /// Download limit in bytes per second, 0 for unlimited.
    SetDownloadLimit { limit: u64 },
    Shutdown,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side closed the socket.
    Remote,
    /// Closed on request of the engine's owner.
    Local,
    /// No traffic within the idle timeout.
    Idle,
    /// Undecodable data.
    Malformed,
    /// Socket error.
    Error,
    /// A file connection delivered its whole payload.
    Complete,
}

/// Snapshot of connection counts and throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    pub connections: usize,
    pub download_connections: usize,
    pub upload_connections: usize,
    /// Bytes per second.
    pub download_speed: u64,
    /// Bytes per second.
    pub upload_speed: u64,
}

/// Events emitted by the network engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    ServerConnected { addr: SocketAddr },
    ServerConnectFailed { addr: SocketAddr, error: String },
    ServerDisconnected,
    ServerMessage(ServerResponse),
    PeerConnected {
        conn: ConnId,
        user: String,
        conn_type: ConnectionType,
        addr: SocketAddr,
    },
    PeerMessage {
        conn: ConnId,
        user: String,
        message: PeerMessage,
    },
    DistributedMessage {
        conn: ConnId,
        user: String,
        message: DistributedMessage,
    },
    /// No connection could be established, directly or indirectly.
    PeerConnectionError {
        user: String,
        conn_type: ConnectionType,
        undelivered: Vec<PeerMessage>,
        /// Upload token of a file connection that never opened.
        file_token: Option<u32>,
        /// The server reported the user as offline.
        offline: bool,
    },
    ConnectionClosed {
        conn: ConnId,
        user: Option<String>,
        role: Option<ConnectionRole>,
        reason: CloseReason,
        undelivered: Vec<PeerMessage>,
    },
    /// An uploader opened a file connection to us and named its token.
    DownloadInitReceived { conn: ConnId, user: String, token: u32 },
    /// The downloader answered our file connection with a resume offset.
    UploadOffsetReceived {
        conn: ConnId,
        user: String,
        token: u32,
        offset: u64,
    },
    DownloadProgress { user: String, token: u32, offset: u64 },
    UploadProgress {
        user: String,
        token: u32,
        offset: u64,
        speed: u64,
    },
    DownloadFileError { user: String, token: u32, error: String },
    UploadFileError { user: String, token: u32, error: String },
    DownloadConnectionClosed { user: String, token: u32, offset: u64 },
    UploadConnectionClosed {
        user: String,
        token: u32,
        offset: u64,
        timed_out: bool,
    },
    Stats(ConnectionStats),
}
