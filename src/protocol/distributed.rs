//! Distributed search network messages ("D" connections).

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::frame::{decode_frame, frame, CodeWidth, Decoded, RawFrame};
use super::wire::{Reader, WireWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DistributedCode {
    Ping = 0,
    Search = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
    EmbeddedMessage = 93,
}

impl TryFrom<u8> for DistributedCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DistributedCode::Ping),
            3 => Ok(DistributedCode::Search),
            4 => Ok(DistributedCode::BranchLevel),
            5 => Ok(DistributedCode::BranchRoot),
            7 => Ok(DistributedCode::ChildDepth),
            93 => Ok(DistributedCode::EmbeddedMessage),
            _ => Err(ProtocolError::InvalidValue(format!("distributed code {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributedMessage {
    Ping,
    Search {
        unknown: u32,
        user: String,
        token: u32,
        query: String,
    },
    BranchLevel { level: i32 },
    BranchRoot { user: String },
    ChildDepth { depth: u32 },
    /// A distributed message forwarded verbatim to child peers.
    EmbeddedMessage { code: u8, payload: Bytes },
}

impl DistributedMessage {
    pub fn code(&self) -> DistributedCode {
        match self {
            DistributedMessage::Ping => DistributedCode::Ping,
            DistributedMessage::Search { .. } => DistributedCode::Search,
            DistributedMessage::BranchLevel { .. } => DistributedCode::BranchLevel,
            DistributedMessage::BranchRoot { .. } => DistributedCode::BranchRoot,
            DistributedMessage::ChildDepth { .. } => DistributedCode::ChildDepth,
            DistributedMessage::EmbeddedMessage { .. } => DistributedCode::EmbeddedMessage,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            DistributedMessage::Ping => {}
            DistributedMessage::Search {
                unknown,
                user,
                token,
                query,
            } => {
                buf.put_u32_le(*unknown);
                buf.put_string(user);
                buf.put_u32_le(*token);
                buf.put_string(query);
            }
            DistributedMessage::BranchLevel { level } => buf.put_i32_le(*level),
            DistributedMessage::BranchRoot { user } => buf.put_string(user),
            DistributedMessage::ChildDepth { depth } => buf.put_u32_le(*depth),
            DistributedMessage::EmbeddedMessage { code, payload } => {
                buf.put_u8(*code);
                buf.put_slice(payload);
            }
        }

        frame(CodeWidth::U8, self.code() as u32, &buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>, ProtocolError> {
        decode_frame(buf, CodeWidth::U8, Self::decode_raw)
    }

    fn decode_raw(raw: &RawFrame<'_>) -> Result<Decoded<Self>, ProtocolError> {
        let Ok(code) = DistributedCode::try_from(raw.code as u8) else {
            return Ok(Decoded::Unsupported {
                code: raw.code,
                consumed: raw.consumed,
            });
        };

        let mut r = Reader::new(raw.payload);
        let message = match code {
            DistributedCode::Ping => DistributedMessage::Ping,
            DistributedCode::Search => DistributedMessage::Search {
                unknown: r.u32()?,
                user: r.string()?,
                token: r.u32()?,
                query: r.string()?,
            },
            DistributedCode::BranchLevel => DistributedMessage::BranchLevel { level: r.i32()? },
            DistributedCode::BranchRoot => DistributedMessage::BranchRoot { user: r.string()? },
            DistributedCode::ChildDepth => DistributedMessage::ChildDepth { depth: r.u32()? },
            DistributedCode::EmbeddedMessage => DistributedMessage::EmbeddedMessage {
                code: r.u8()?,
                payload: r.rest(),
            },
        };

        Ok(Decoded::Message(message, raw.consumed))
    }
}
