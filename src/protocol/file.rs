//! Unframed handshake values on "F" connections.
//!
//! The uploader opens the connection and writes a bare 4-byte transfer token.
//! The downloader answers with a bare 8-byte resume offset. Everything after
//! that is raw file content.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::Decoded;

pub const FILE_TRANSFER_INIT_LEN: usize = 4;
pub const FILE_OFFSET_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTransferInit {
    pub token: u32,
}

impl FileTransferInit {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_TRANSFER_INIT_LEN);
        buf.put_u32_le(self.token);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Decoded<Self> {
        if buf.len() < FILE_TRANSFER_INIT_LEN {
            return Decoded::NeedMoreBytes;
        }
        let token = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Decoded::Message(Self { token }, FILE_TRANSFER_INIT_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOffset {
    pub offset: u64,
}

impl FileOffset {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_OFFSET_LEN);
        buf.put_u64_le(self.offset);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Decoded<Self> {
        if buf.len() < FILE_OFFSET_LEN {
            return Decoded::NeedMoreBytes;
        }
        let mut raw = [0u8; FILE_OFFSET_LEN];
        raw.copy_from_slice(&buf[..FILE_OFFSET_LEN]);
        Decoded::Message(
            Self {
                offset: u64::from_le_bytes(raw),
            },
            FILE_OFFSET_LEN,
        )
    }
}
