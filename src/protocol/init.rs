//! The first message on a freshly opened peer socket.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::frame::{frame, split_frame, CodeWidth, Decoded};
use super::wire::{Reader, WireWrite};
use super::ConnectionType;

const PIERCE_FIREWALL: u32 = 0;
const PEER_INIT: u32 = 1;

/// Peer-init messages use a one-byte code and are only valid as the very first
/// message on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerInit {
    /// Sent by the side answering an indirect connection request. The token
    /// comes from the ConnectToPeer message relayed by the server.
    PierceFirewall { token: u32 },
    /// Sent by the side that opened a direct connection.
    PeerInit {
        username: String,
        conn_type: ConnectionType,
        token: u32,
    },
}

impl PeerInit {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            PeerInit::PierceFirewall { token } => {
                buf.put_u32_le(*token);
                frame(CodeWidth::U8, PIERCE_FIREWALL, &buf)
            }
            PeerInit::PeerInit {
                username,
                conn_type,
                token,
            } => {
                buf.put_string(username);
                buf.put_string(conn_type.as_str());
                buf.put_u32_le(*token);
                frame(CodeWidth::U8, PEER_INIT, &buf)
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>, ProtocolError> {
        let Some(raw) = split_frame(buf, CodeWidth::U8)? else {
            return Ok(Decoded::NeedMoreBytes);
        };

        let mut r = Reader::new(raw.payload);
        let message = match raw.code {
            PIERCE_FIREWALL => PeerInit::PierceFirewall { token: r.u32()? },
            PEER_INIT => {
                let username = r.string()?;
                let conn_type = ConnectionType::parse(&r.string()?)?;
                // Some clients omit the token entirely
                let token = if r.remaining() >= 4 { r.u32()? } else { 0 };
                PeerInit::PeerInit {
                    username,
                    conn_type,
                    token,
                }
            }
            // An unknown first message leaves the connection without a role
            other => {
                return Err(ProtocolError::InvalidValue(format!(
                    "peer init code {}",
                    other
                )))
            }
        };

        Ok(Decoded::Message(message, raw.consumed))
    }
}
