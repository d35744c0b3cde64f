//! Soulseek wire protocol codec.
//!
//! This module encodes and decodes every message the engine exchanges with
//! the server and with peers. It performs no I/O: decoders take a byte slice
//! and report how many bytes a complete message occupied, so the caller can
//! feed partially received data and retry once more bytes arrive.
//!
//! # Families
//!
//! - [`ServerRequest`] / [`ServerResponse`]: server connection, `u32` codes
//! - [`PeerInit`]: first message on a peer socket, `u8` codes
//! - [`PeerMessage`]: "P" connections, `u32` codes
//! - [`DistributedMessage`]: "D" connections, `u8` codes
//! - [`FileTransferInit`] / [`FileOffset`]: unframed "F" connection handshake
//!
//! # Examples
//!
//! ```
//! use rslsk::protocol::{decode, Decoded, FrameKind, Message, PeerMessage};
//!
//! let bytes = PeerMessage::QueueUpload { file: "music\\song.flac".into() }
//!     .encode()
//!     .unwrap();
//!
//! // Partial frames are not errors
//! assert_eq!(decode(FrameKind::Peer, &bytes[..6]).unwrap(), Decoded::NeedMoreBytes);
//!
//! match decode(FrameKind::Peer, &bytes).unwrap() {
//!     Decoded::Message(Message::Peer(msg), consumed) => {
//!         assert_eq!(consumed, bytes.len());
//!         assert_eq!(msg.file(), Some("music\\song.flac"));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

mod distributed;
mod error;
mod file;
mod frame;
mod init;
mod peer;
mod server;
mod wire;

pub use distributed::{DistributedCode, DistributedMessage};
pub use error::ProtocolError;
pub use file::{FileOffset, FileTransferInit, FILE_OFFSET_LEN, FILE_TRANSFER_INIT_LEN};
pub use frame::Decoded;
pub use init::PeerInit;
pub use peer::{
    FileAttribute, FolderContents, PeerCode, PeerMessage, SharedDirectory, SharedFile,
    TransferDirection, TransferReply,
};
pub use server::{
    login_hash, LoginReply, PotentialParent, ServerCode, ServerRequest, ServerResponse,
    UserStats, UserStatus, WatchedUser,
};
pub use wire::TextEncoding;

use bytes::Bytes;

/// Purpose of a peer connection, sent in PeerInit and ConnectToPeer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// "P": control messages.
    Peer,
    /// "F": file transfer.
    File,
    /// "D": distributed search network.
    Distributed,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::File => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "P" => Ok(ConnectionType::Peer),
            "F" => Ok(ConnectionType::File),
            "D" => Ok(ConnectionType::Distributed),
            other => Err(ProtocolError::InvalidValue(format!(
                "connection type {:?}",
                other
            ))),
        }
    }
}

/// What the next bytes on a connection are expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Server to client messages.
    Server,
    /// Client to server messages, as seen by a server.
    ServerRequest,
    /// First message of a peer socket.
    PeerInit,
    Peer,
    Distributed,
    /// The 4-byte token opening an "F" connection.
    FileTransferInit,
    /// The 8-byte resume offset answering it.
    FileOffset,
}

/// Any decodable message, tagged by family.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ToServer(ServerRequest),
    FromServer(ServerResponse),
    Init(PeerInit),
    Peer(PeerMessage),
    Distributed(DistributedMessage),
    FileTransferInit(FileTransferInit),
    FileOffset(FileOffset),
}

impl Message {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(match self {
            Message::ToServer(m) => m.encode(),
            Message::FromServer(m) => m.encode(),
            Message::Init(m) => m.encode(),
            Message::Peer(m) => m.encode()?,
            Message::Distributed(m) => m.encode(),
            Message::FileTransferInit(m) => m.encode(),
            Message::FileOffset(m) => m.encode(),
        })
    }

    /// The frame kind this message is decoded with.
    pub fn frame_kind(&self) -> FrameKind {
        match self {
            Message::ToServer(_) => FrameKind::ServerRequest,
            Message::FromServer(_) => FrameKind::Server,
            Message::Init(_) => FrameKind::PeerInit,
            Message::Peer(_) => FrameKind::Peer,
            Message::Distributed(_) => FrameKind::Distributed,
            Message::FileTransferInit(_) => FrameKind::FileTransferInit,
            Message::FileOffset(_) => FrameKind::FileOffset,
        }
    }
}

/// Decodes the first message in `buf`.
///
/// Never consumes past the declared frame length. A truncated buffer yields
/// [`Decoded::NeedMoreBytes`]. A payload that does not parse yields
/// [`Decoded::Malformed`]; an error means the framing itself is broken and the
/// connection must be closed.
pub fn decode(kind: FrameKind, buf: &[u8]) -> Result<Decoded<Message>, ProtocolError> {
    Ok(match kind {
        FrameKind::Server => ServerResponse::decode(buf)?.map(Message::FromServer),
        FrameKind::ServerRequest => ServerRequest::decode(buf)?.map(Message::ToServer),
        FrameKind::PeerInit => PeerInit::decode(buf)?.map(Message::Init),
        FrameKind::Peer => PeerMessage::decode(buf)?.map(Message::Peer),
        FrameKind::Distributed => DistributedMessage::decode(buf)?.map(Message::Distributed),
        FrameKind::FileTransferInit => FileTransferInit::decode(buf).map(Message::FileTransferInit),
        FrameKind::FileOffset => FileOffset::decode(buf).map(Message::FileOffset),
    })
}

#[cfg(test)]
mod tests;
