//! Primitive field readers and writers shared by every message family.

use std::io::{Read, Write};
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::error::ProtocolError;
use crate::constants::MAX_DECOMPRESSED_SIZE;

/// How outgoing strings are encoded.
///
/// Incoming strings are always decoded as UTF-8 first with a Latin-1 fallback,
/// so the choice only matters when sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// Latin-1 when every character fits in one byte, UTF-8 otherwise. Older
    /// clients (Soulseek NS) only match file names sent this way.
    Latin1,
}

pub(crate) fn encode_text(text: &str, encoding: TextEncoding) -> Vec<u8> {
    match encoding {
        TextEncoding::Latin1 if text.chars().all(|c| (c as u32) <= 0xFF) => {
            text.chars().map(|c| c as u8).collect()
        }
        _ => text.as_bytes().to_vec(),
    }
}

pub(crate) fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Bounds-checked little-endian reader over a single message payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a file size. Soulseek NS writes sizes above 2 GiB as a u32
    /// followed by `0xFFFFFFFF`; such values keep only the low word.
    pub fn file_size(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        if self.buf[7] == 0xFF {
            let size = self.buf.get_u32_le();
            self.buf.advance(4);
            return Ok(size as u64);
        }
        Ok(self.buf.get_u64_le())
    }

    /// Reads a length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        self.ensure(len)?;
        let text = decode_text(&self.buf[..len]);
        self.buf.advance(len);
        Ok(text)
    }

    /// Reads an IPv4 address, stored in reverse byte order on the wire.
    pub fn ip(&mut self) -> Result<Ipv4Addr, ProtocolError> {
        self.ensure(4)?;
        let mut octets = [0u8; 4];
        self.buf.copy_to_slice(&mut octets);
        octets.reverse();
        Ok(Ipv4Addr::from(octets))
    }

    /// Consumes everything that is left.
    pub fn rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.copy_to_bytes(len)
    }
}

/// Field writers matching [`Reader`].
pub(crate) trait WireWrite {
    fn put_flag(&mut self, value: bool);
    fn put_string(&mut self, text: &str);
    fn put_string_with(&mut self, text: &str, encoding: TextEncoding);
    fn put_prefixed(&mut self, data: &[u8]);
    fn put_ip(&mut self, ip: Ipv4Addr);
}

impl WireWrite for BytesMut {
    fn put_flag(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_string(&mut self, text: &str) {
        self.put_string_with(text, TextEncoding::Utf8);
    }

    fn put_string_with(&mut self, text: &str, encoding: TextEncoding) {
        let encoded = encode_text(text, encoding);
        self.put_prefixed(&encoded);
    }

    fn put_prefixed(&mut self, data: &[u8]) {
        self.put_u32_le(data.len() as u32);
        self.put_slice(data);
    }

    fn put_ip(&mut self, ip: Ipv4Addr) {
        let mut octets = ip.octets();
        octets.reverse();
        self.put_slice(&octets);
    }
}

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompress(e.to_string()))?;

    if out.len() > MAX_DECOMPRESSED_SIZE {
        return Err(ProtocolError::InvalidLength(out.len()));
    }
    Ok(out)
}
