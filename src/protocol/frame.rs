//! Length-prefixed framing.
//!
//! Server, peer, peer-init and distributed connections all frame messages as a
//! little-endian `u32` length (not counting itself) followed by a message code
//! and the payload. The code is four bytes wide on server and peer
//! connections and one byte wide on peer-init and distributed connections.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use crate::constants::MAX_MESSAGE_SIZE;

/// Outcome of attempting to decode one message from a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A complete message and the number of bytes it occupied.
    Message(T, usize),
    /// The buffer holds a partial frame. Nothing was consumed.
    NeedMoreBytes,
    /// A complete frame with a code this engine does not implement. The frame
    /// should be skipped, the connection stays usable.
    Unsupported { code: u32, consumed: usize },
    /// A complete frame whose payload could not be decoded. Only this frame
    /// is dropped.
    Malformed {
        code: u32,
        consumed: usize,
        reason: String,
    },
}

impl<T> Decoded<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Message(message, consumed) => Decoded::Message(f(message), consumed),
            Decoded::NeedMoreBytes => Decoded::NeedMoreBytes,
            Decoded::Unsupported { code, consumed } => Decoded::Unsupported { code, consumed },
            Decoded::Malformed {
                code,
                consumed,
                reason,
            } => Decoded::Malformed {
                code,
                consumed,
                reason,
            },
        }
    }

    /// Bytes to drop from the buffer, zero when more data is needed.
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::Message(_, consumed) => *consumed,
            Decoded::NeedMoreBytes => 0,
            Decoded::Unsupported { consumed, .. } => *consumed,
            Decoded::Malformed { consumed, .. } => *consumed,
        }
    }
}

/// Width of the message code following the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodeWidth {
    U8,
    U32,
}

impl CodeWidth {
    fn len(self) -> usize {
        match self {
            CodeWidth::U8 => 1,
            CodeWidth::U32 => 4,
        }
    }
}

/// A complete frame borrowed from the input buffer.
pub(crate) struct RawFrame<'a> {
    pub code: u32,
    pub payload: &'a [u8],
    pub consumed: usize,
}

/// Splits the first frame off `buf` without copying.
///
/// Returns `Ok(None)` until the whole declared length is buffered.
pub(crate) fn split_frame(
    buf: &[u8],
    width: CodeWidth,
) -> Result<Option<RawFrame<'_>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length < width.len() || length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::InvalidLength(length));
    }

    let total = 4 + length;
    if buf.len() < total {
        return Ok(None);
    }

    let code_end = 4 + width.len();
    let code = match width {
        CodeWidth::U8 => buf[4] as u32,
        CodeWidth::U32 => u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
    };

    Ok(Some(RawFrame {
        code,
        payload: &buf[code_end..total],
        consumed: total,
    }))
}

/// Splits the first frame off `buf` and decodes its payload with `body`.
///
/// Framing faults are errors. A payload that `body` rejects becomes
/// [`Decoded::Malformed`] and the rest of the buffer stays decodable.
pub(crate) fn decode_frame<T>(
    buf: &[u8],
    width: CodeWidth,
    body: impl FnOnce(&RawFrame<'_>) -> Result<Decoded<T>, ProtocolError>,
) -> Result<Decoded<T>, ProtocolError> {
    let Some(raw) = split_frame(buf, width)? else {
        return Ok(Decoded::NeedMoreBytes);
    };
    match body(&raw) {
        Err(e) => Ok(Decoded::Malformed {
            code: raw.code,
            consumed: raw.consumed,
            reason: e.to_string(),
        }),
        decoded => decoded,
    }
}

/// Prefixes `payload` with its length and code.
pub(crate) fn frame(width: CodeWidth, code: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + width.len() + payload.len());
    buf.put_u32_le((width.len() + payload.len()) as u32);
    match width {
        CodeWidth::U8 => buf.put_u8(code as u8),
        CodeWidth::U32 => buf.put_u32_le(code),
    }
    buf.put_slice(payload);
    buf.freeze()
}
