//! Server messages.
//!
//! Many codes carry a different layout depending on direction (the client
//! sends a username, the server answers with the username plus data), so
//! requests and responses are separate enums sharing one code table.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

use super::error::ProtocolError;
use super::frame::{decode_frame, frame, CodeWidth, Decoded, RawFrame};
use super::wire::{Reader, TextEncoding, WireWrite};
use super::ConnectionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerCode {
    Login = 1,
    SetWaitPort = 2,
    GetPeerAddress = 3,
    WatchUser = 5,
    UnwatchUser = 6,
    GetUserStatus = 7,
    ConnectToPeer = 18,
    FileSearch = 26,
    SetStatus = 28,
    ServerPing = 32,
    SharedFoldersFiles = 35,
    GetUserStats = 36,
    Relogged = 41,
    UserSearch = 42,
    PrivilegedUsers = 69,
    HaveNoParent = 71,
    ParentMinSpeed = 83,
    ParentSpeedRatio = 84,
    AddToPrivileged = 91,
    CheckPrivileges = 92,
    EmbeddedMessage = 93,
    AcceptChildren = 100,
    PossibleParents = 102,
    RoomSearch = 120,
    SendUploadSpeed = 121,
    UserPrivileged = 122,
    BranchLevel = 126,
    BranchRoot = 127,
    ResetDistributed = 130,
    CantConnectToPeer = 1001,
}

impl TryFrom<u32> for ServerCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ServerCode::Login),
            2 => Ok(ServerCode::SetWaitPort),
            3 => Ok(ServerCode::GetPeerAddress),
            5 => Ok(ServerCode::WatchUser),
            6 => Ok(ServerCode::UnwatchUser),
            7 => Ok(ServerCode::GetUserStatus),
            18 => Ok(ServerCode::ConnectToPeer),
            26 => Ok(ServerCode::FileSearch),
            28 => Ok(ServerCode::SetStatus),
            32 => Ok(ServerCode::ServerPing),
            35 => Ok(ServerCode::SharedFoldersFiles),
            36 => Ok(ServerCode::GetUserStats),
            41 => Ok(ServerCode::Relogged),
            42 => Ok(ServerCode::UserSearch),
            69 => Ok(ServerCode::PrivilegedUsers),
            71 => Ok(ServerCode::HaveNoParent),
            83 => Ok(ServerCode::ParentMinSpeed),
            84 => Ok(ServerCode::ParentSpeedRatio),
            91 => Ok(ServerCode::AddToPrivileged),
            92 => Ok(ServerCode::CheckPrivileges),
            93 => Ok(ServerCode::EmbeddedMessage),
            100 => Ok(ServerCode::AcceptChildren),
            102 => Ok(ServerCode::PossibleParents),
            120 => Ok(ServerCode::RoomSearch),
            121 => Ok(ServerCode::SendUploadSpeed),
            122 => Ok(ServerCode::UserPrivileged),
            126 => Ok(ServerCode::BranchLevel),
            127 => Ok(ServerCode::BranchRoot),
            130 => Ok(ServerCode::ResetDistributed),
            1001 => Ok(ServerCode::CantConnectToPeer),
            _ => Err(ProtocolError::InvalidValue(format!("server code {}", value))),
        }
    }
}

/// Presence of a user as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserStatus {
    Offline = 0,
    Away = 1,
    Online = 2,
}

impl UserStatus {
    pub fn is_online(self) -> bool {
        self != UserStatus::Offline
    }
}

impl TryFrom<u32> for UserStatus {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UserStatus::Offline),
            1 => Ok(UserStatus::Away),
            2 => Ok(UserStatus::Online),
            _ => Err(ProtocolError::InvalidValue(format!("user status {}", value))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStats {
    pub avg_speed: u32,
    pub upload_count: u64,
    pub files: u32,
    pub dirs: u32,
}

impl UserStats {
    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            avg_speed: r.u32()?,
            upload_count: r.u64()?,
            files: r.u32()?,
            dirs: r.u32()?,
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.avg_speed);
        buf.put_u64_le(self.upload_count);
        buf.put_u32_le(self.files);
        buf.put_u32_le(self.dirs);
    }
}

/// Details of a watched user that exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedUser {
    pub status: UserStatus,
    pub stats: UserStats,
    /// Only sent for users that are online.
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    Success {
        greeting: String,
        own_ip: Ipv4Addr,
        /// MD5 hex digest of the password, sent by newer servers.
        password_hash: Option<String>,
    },
    Failure {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PotentialParent {
    pub user: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

/// Messages we send to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    Login {
        username: String,
        password: String,
        version: u32,
        minor_version: u32,
    },
    SetWaitPort { port: u32 },
    GetPeerAddress { user: String },
    WatchUser { user: String },
    UnwatchUser { user: String },
    GetUserStatus { user: String },
    ConnectToPeer { token: u32, user: String, conn_type: ConnectionType },
    FileSearch { token: u32, query: String },
    SetStatus { status: UserStatus },
    ServerPing,
    SharedFoldersFiles { folders: u32, files: u32 },
    GetUserStats { user: String },
    UserSearch { user: String, token: u32, query: String },
    HaveNoParent { no_parent: bool },
    CheckPrivileges,
    AcceptChildren { accept: bool },
    RoomSearch { room: String, token: u32, query: String },
    SendUploadSpeed { speed: u32 },
    BranchLevel { level: u32 },
    BranchRoot { user: String },
    CantConnectToPeer { token: u32, user: String },
}

/// MD5 hex digest of `username + password`, as expected by the server.
pub fn login_hash(username: &str, password: &str) -> String {
    let digest = Md5::digest(format!("{}{}", username, password).as_bytes());
    digest
        .iter()
        .fold(String::with_capacity(digest.len() * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

impl ServerRequest {
    pub fn code(&self) -> ServerCode {
        match self {
            ServerRequest::Login { .. } => ServerCode::Login,
            ServerRequest::SetWaitPort { .. } => ServerCode::SetWaitPort,
            ServerRequest::GetPeerAddress { .. } => ServerCode::GetPeerAddress,
            ServerRequest::WatchUser { .. } => ServerCode::WatchUser,
            ServerRequest::UnwatchUser { .. } => ServerCode::UnwatchUser,
            ServerRequest::GetUserStatus { .. } => ServerCode::GetUserStatus,
            ServerRequest::ConnectToPeer { .. } => ServerCode::ConnectToPeer,
            ServerRequest::FileSearch { .. } => ServerCode::FileSearch,
            ServerRequest::SetStatus { .. } => ServerCode::SetStatus,
            ServerRequest::ServerPing => ServerCode::ServerPing,
            ServerRequest::SharedFoldersFiles { .. } => ServerCode::SharedFoldersFiles,
            ServerRequest::GetUserStats { .. } => ServerCode::GetUserStats,
            ServerRequest::UserSearch { .. } => ServerCode::UserSearch,
            ServerRequest::HaveNoParent { .. } => ServerCode::HaveNoParent,
            ServerRequest::CheckPrivileges => ServerCode::CheckPrivileges,
            ServerRequest::AcceptChildren { .. } => ServerCode::AcceptChildren,
            ServerRequest::RoomSearch { .. } => ServerCode::RoomSearch,
            ServerRequest::SendUploadSpeed { .. } => ServerCode::SendUploadSpeed,
            ServerRequest::BranchLevel { .. } => ServerCode::BranchLevel,
            ServerRequest::BranchRoot { .. } => ServerCode::BranchRoot,
            ServerRequest::CantConnectToPeer { .. } => ServerCode::CantConnectToPeer,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ServerRequest::Login {
                username,
                password,
                version,
                minor_version,
            } => {
                buf.put_string(username);
                buf.put_string(password);
                buf.put_u32_le(*version);
                buf.put_string(&login_hash(username, password));
                buf.put_u32_le(*minor_version);
            }
            ServerRequest::SetWaitPort { port } => buf.put_u32_le(*port),
            ServerRequest::GetPeerAddress { user }
            | ServerRequest::WatchUser { user }
            | ServerRequest::UnwatchUser { user }
            | ServerRequest::GetUserStatus { user }
            | ServerRequest::GetUserStats { user }
            | ServerRequest::BranchRoot { user } => buf.put_string(user),
            ServerRequest::ConnectToPeer {
                token,
                user,
                conn_type,
            } => {
                buf.put_u32_le(*token);
                buf.put_string(user);
                buf.put_string(conn_type.as_str());
            }
            ServerRequest::FileSearch { token, query } => {
                buf.put_u32_le(*token);
                buf.put_string_with(query, TextEncoding::Latin1);
            }
            ServerRequest::SetStatus { status } => buf.put_i32_le(*status as i32),
            ServerRequest::ServerPing | ServerRequest::CheckPrivileges => {}
            ServerRequest::SharedFoldersFiles { folders, files } => {
                buf.put_u32_le(*folders);
                buf.put_u32_le(*files);
            }
            ServerRequest::UserSearch { user, token, query } => {
                buf.put_string(user);
                buf.put_u32_le(*token);
                buf.put_string_with(query, TextEncoding::Latin1);
            }
            ServerRequest::HaveNoParent { no_parent } => buf.put_flag(*no_parent),
            ServerRequest::AcceptChildren { accept } => buf.put_flag(*accept),
            ServerRequest::RoomSearch { room, token, query } => {
                buf.put_string(room);
                buf.put_u32_le(*token);
                buf.put_string_with(query, TextEncoding::Latin1);
            }
            ServerRequest::SendUploadSpeed { speed } => buf.put_u32_le(*speed),
            ServerRequest::BranchLevel { level } => buf.put_u32_le(*level),
            ServerRequest::CantConnectToPeer { token, user } => {
                buf.put_u32_le(*token);
                buf.put_string(user);
            }
        }

        frame(CodeWidth::U32, self.code() as u32, &buf)
    }

    /// Decodes a request as the server would. Used by test servers and tools.
    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>, ProtocolError> {
        decode_frame(buf, CodeWidth::U32, Self::decode_raw)
    }

    fn decode_raw(raw: &RawFrame<'_>) -> Result<Decoded<Self>, ProtocolError> {
        let Ok(code) = ServerCode::try_from(raw.code) else {
            return Ok(Decoded::Unsupported {
                code: raw.code,
                consumed: raw.consumed,
            });
        };

        let mut r = Reader::new(raw.payload);
        let message = match code {
            ServerCode::Login => {
                let username = r.string()?;
                let password = r.string()?;
                let version = r.u32()?;
                let _hash = r.string()?;
                let minor_version = r.u32()?;
                ServerRequest::Login {
                    username,
                    password,
                    version,
                    minor_version,
                }
            }
            ServerCode::SetWaitPort => ServerRequest::SetWaitPort { port: r.u32()? },
            ServerCode::GetPeerAddress => ServerRequest::GetPeerAddress { user: r.string()? },
            ServerCode::WatchUser => ServerRequest::WatchUser { user: r.string()? },
            ServerCode::UnwatchUser => ServerRequest::UnwatchUser { user: r.string()? },
            ServerCode::GetUserStatus => ServerRequest::GetUserStatus { user: r.string()? },
            ServerCode::ConnectToPeer => ServerRequest::ConnectToPeer {
                token: r.u32()?,
                user: r.string()?,
                conn_type: ConnectionType::parse(&r.string()?)?,
            },
            ServerCode::FileSearch => ServerRequest::FileSearch {
                token: r.u32()?,
                query: r.string()?,
            },
            ServerCode::SetStatus => {
                let value = r.i32()?;
                ServerRequest::SetStatus {
                    status: UserStatus::try_from(value as u32)?,
                }
            }
            ServerCode::ServerPing => ServerRequest::ServerPing,
            ServerCode::SharedFoldersFiles => ServerRequest::SharedFoldersFiles {
                folders: r.u32()?,
                files: r.u32()?,
            },
            ServerCode::GetUserStats => ServerRequest::GetUserStats { user: r.string()? },
            ServerCode::UserSearch => ServerRequest::UserSearch {
                user: r.string()?,
                token: r.u32()?,
                query: r.string()?,
            },
            ServerCode::HaveNoParent => ServerRequest::HaveNoParent {
                no_parent: r.bool()?,
            },
            ServerCode::CheckPrivileges => ServerRequest::CheckPrivileges,
            ServerCode::AcceptChildren => ServerRequest::AcceptChildren { accept: r.bool()? },
            ServerCode::RoomSearch => ServerRequest::RoomSearch {
                room: r.string()?,
                token: r.u32()?,
                query: r.string()?,
            },
            ServerCode::SendUploadSpeed => ServerRequest::SendUploadSpeed { speed: r.u32()? },
            ServerCode::BranchLevel => ServerRequest::BranchLevel { level: r.u32()? },
            ServerCode::BranchRoot => ServerRequest::BranchRoot { user: r.string()? },
            ServerCode::CantConnectToPeer => ServerRequest::CantConnectToPeer {
                token: r.u32()?,
                user: r.string()?,
            },
            ServerCode::Relogged
            | ServerCode::PrivilegedUsers
            | ServerCode::ParentMinSpeed
            | ServerCode::ParentSpeedRatio
            | ServerCode::AddToPrivileged
            | ServerCode::EmbeddedMessage
            | ServerCode::PossibleParents
            | ServerCode::UserPrivileged
            | ServerCode::ResetDistributed => {
                return Ok(Decoded::Unsupported {
                    code: raw.code,
                    consumed: raw.consumed,
                })
            }
        };

        Ok(Decoded::Message(message, raw.consumed))
    }
}

/// Messages the server sends to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    Login(LoginReply),
    PeerAddress { user: String, ip: Ipv4Addr, port: u32 },
    WatchUser { user: String, details: Option<WatchedUser> },
    UserStatus { user: String, status: UserStatus, privileged: Option<bool> },
    ConnectToPeer {
        user: String,
        conn_type: ConnectionType,
        ip: Ipv4Addr,
        port: u32,
        token: u32,
        privileged: Option<bool>,
    },
    FileSearch { user: String, token: u32, query: String },
    UserStats { user: String, stats: UserStats },
    Relogged,
    PrivilegedUsers { users: Vec<String> },
    ParentMinSpeed { speed: u32 },
    ParentSpeedRatio { ratio: u32 },
    AddToPrivileged { user: String },
    CheckPrivileges { seconds: u32 },
    /// A distributed message relayed by the server when we are a branch root.
    EmbeddedMessage { code: u8, payload: Bytes },
    PossibleParents { parents: Vec<PotentialParent> },
    UserPrivileged { user: String, privileged: bool },
    ResetDistributed,
    CantConnectToPeer { token: u32 },
}

impl ServerResponse {
    pub fn code(&self) -> ServerCode {
        match self {
            ServerResponse::Login(_) => ServerCode::Login,
            ServerResponse::PeerAddress { .. } => ServerCode::GetPeerAddress,
            ServerResponse::WatchUser { .. } => ServerCode::WatchUser,
            ServerResponse::UserStatus { .. } => ServerCode::GetUserStatus,
            ServerResponse::ConnectToPeer { .. } => ServerCode::ConnectToPeer,
            ServerResponse::FileSearch { .. } => ServerCode::FileSearch,
            ServerResponse::UserStats { .. } => ServerCode::GetUserStats,
            ServerResponse::Relogged => ServerCode::Relogged,
            ServerResponse::PrivilegedUsers { .. } => ServerCode::PrivilegedUsers,
            ServerResponse::ParentMinSpeed { .. } => ServerCode::ParentMinSpeed,
            ServerResponse::ParentSpeedRatio { .. } => ServerCode::ParentSpeedRatio,
            ServerResponse::AddToPrivileged { .. } => ServerCode::AddToPrivileged,
            ServerResponse::CheckPrivileges { .. } => ServerCode::CheckPrivileges,
            ServerResponse::EmbeddedMessage { .. } => ServerCode::EmbeddedMessage,
            ServerResponse::PossibleParents { .. } => ServerCode::PossibleParents,
            ServerResponse::UserPrivileged { .. } => ServerCode::UserPrivileged,
            ServerResponse::ResetDistributed => ServerCode::ResetDistributed,
            ServerResponse::CantConnectToPeer { .. } => ServerCode::CantConnectToPeer,
        }
    }

    /// Encodes a response as the server would. Used by test servers and tools.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ServerResponse::Login(LoginReply::Success {
                greeting,
                own_ip,
                password_hash,
            }) => {
                buf.put_flag(true);
                buf.put_string(greeting);
                buf.put_ip(*own_ip);
                if let Some(hash) = password_hash {
                    buf.put_string(hash);
                }
            }
            ServerResponse::Login(LoginReply::Failure { reason }) => {
                buf.put_flag(false);
                buf.put_string(reason);
            }
            ServerResponse::PeerAddress { user, ip, port } => {
                buf.put_string(user);
                buf.put_ip(*ip);
                buf.put_u32_le(*port);
            }
            ServerResponse::WatchUser { user, details } => {
                buf.put_string(user);
                buf.put_flag(details.is_some());
                if let Some(details) = details {
                    buf.put_u32_le(details.status as u32);
                    details.stats.write(&mut buf);
                    if let Some(country) = &details.country {
                        buf.put_string(country);
                    }
                }
            }
            ServerResponse::UserStatus {
                user,
                status,
                privileged,
            } => {
                buf.put_string(user);
                buf.put_u32_le(*status as u32);
                if let Some(privileged) = privileged {
                    buf.put_flag(*privileged);
                }
            }
            ServerResponse::ConnectToPeer {
                user,
                conn_type,
                ip,
                port,
                token,
                privileged,
            } => {
                buf.put_string(user);
                buf.put_string(conn_type.as_str());
                buf.put_ip(*ip);
                buf.put_u32_le(*port);
                buf.put_u32_le(*token);
                if let Some(privileged) = privileged {
                    buf.put_flag(*privileged);
                }
            }
            ServerResponse::FileSearch { user, token, query } => {
                buf.put_string(user);
                buf.put_u32_le(*token);
                buf.put_string(query);
            }
            ServerResponse::UserStats { user, stats } => {
                buf.put_string(user);
                stats.write(&mut buf);
            }
            ServerResponse::Relogged | ServerResponse::ResetDistributed => {}
            ServerResponse::PrivilegedUsers { users } => {
                buf.put_u32_le(users.len() as u32);
                for user in users {
                    buf.put_string(user);
                }
            }
            ServerResponse::ParentMinSpeed { speed } => buf.put_u32_le(*speed),
            ServerResponse::ParentSpeedRatio { ratio } => buf.put_u32_le(*ratio),
            ServerResponse::AddToPrivileged { user } => buf.put_string(user),
            ServerResponse::CheckPrivileges { seconds } => buf.put_u32_le(*seconds),
            ServerResponse::EmbeddedMessage { code, payload } => {
                buf.put_u8(*code);
                buf.put_slice(payload);
            }
            ServerResponse::PossibleParents { parents } => {
                buf.put_u32_le(parents.len() as u32);
                for parent in parents {
                    buf.put_string(&parent.user);
                    buf.put_ip(parent.ip);
                    buf.put_u32_le(parent.port);
                }
            }
            ServerResponse::UserPrivileged { user, privileged } => {
                buf.put_string(user);
                buf.put_flag(*privileged);
            }
            ServerResponse::CantConnectToPeer { token } => buf.put_u32_le(*token),
        }

        frame(CodeWidth::U32, self.code() as u32, &buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Decoded<Self>, ProtocolError> {
        decode_frame(buf, CodeWidth::U32, Self::decode_raw)
    }

    fn decode_raw(raw: &RawFrame<'_>) -> Result<Decoded<Self>, ProtocolError> {
        let Ok(code) = ServerCode::try_from(raw.code) else {
            return Ok(Decoded::Unsupported {
                code: raw.code,
                consumed: raw.consumed,
            });
        };

        let mut r = Reader::new(raw.payload);
        let message = match code {
            ServerCode::Login => {
                if r.bool()? {
                    let greeting = r.string()?;
                    let own_ip = r.ip()?;
                    let password_hash = if r.is_empty() { None } else { Some(r.string()?) };
                    ServerResponse::Login(LoginReply::Success {
                        greeting,
                        own_ip,
                        password_hash,
                    })
                } else {
                    ServerResponse::Login(LoginReply::Failure { reason: r.string()? })
                }
            }
            ServerCode::GetPeerAddress => ServerResponse::PeerAddress {
                user: r.string()?,
                ip: r.ip()?,
                port: r.u32()?,
            },
            ServerCode::WatchUser => {
                let user = r.string()?;
                let exists = r.bool()?;
                let details = if exists {
                    let status = UserStatus::try_from(r.u32()?)?;
                    let stats = UserStats::read(&mut r)?;
                    let country = if r.is_empty() { None } else { Some(r.string()?) };
                    Some(WatchedUser {
                        status,
                        stats,
                        country,
                    })
                } else {
                    None
                };
                ServerResponse::WatchUser { user, details }
            }
            ServerCode::GetUserStatus => ServerResponse::UserStatus {
                user: r.string()?,
                status: UserStatus::try_from(r.u32()?)?,
                privileged: if r.is_empty() { None } else { Some(r.bool()?) },
            },
            ServerCode::ConnectToPeer => ServerResponse::ConnectToPeer {
                user: r.string()?,
                conn_type: ConnectionType::parse(&r.string()?)?,
                ip: r.ip()?,
                port: r.u32()?,
                token: r.u32()?,
                privileged: if r.is_empty() { None } else { Some(r.bool()?) },
            },
            ServerCode::FileSearch => ServerResponse::FileSearch {
                user: r.string()?,
                token: r.u32()?,
                query: r.string()?,
            },
            ServerCode::GetUserStats => ServerResponse::UserStats {
                user: r.string()?,
                stats: UserStats::read(&mut r)?,
            },
            ServerCode::Relogged => ServerResponse::Relogged,
            ServerCode::PrivilegedUsers => {
                let count = r.u32()? as usize;
                let mut users = Vec::with_capacity(count.min(r.remaining() / 4));
                for _ in 0..count {
                    users.push(r.string()?);
                }
                ServerResponse::PrivilegedUsers { users }
            }
            ServerCode::ParentMinSpeed => ServerResponse::ParentMinSpeed { speed: r.u32()? },
            ServerCode::ParentSpeedRatio => ServerResponse::ParentSpeedRatio { ratio: r.u32()? },
            ServerCode::AddToPrivileged => ServerResponse::AddToPrivileged { user: r.string()? },
            ServerCode::CheckPrivileges => ServerResponse::CheckPrivileges { seconds: r.u32()? },
            ServerCode::EmbeddedMessage => ServerResponse::EmbeddedMessage {
                code: r.u8()?,
                payload: r.rest(),
            },
            ServerCode::PossibleParents => {
                let count = r.u32()? as usize;
                let mut parents = Vec::with_capacity(count.min(r.remaining() / 12));
                for _ in 0..count {
                    parents.push(PotentialParent {
                        user: r.string()?,
                        ip: r.ip()?,
                        port: r.u32()?,
                    });
                }
                ServerResponse::PossibleParents { parents }
            }
            ServerCode::UserPrivileged => ServerResponse::UserPrivileged {
                user: r.string()?,
                privileged: r.bool()?,
            },
            ServerCode::ResetDistributed => ServerResponse::ResetDistributed,
            ServerCode::CantConnectToPeer => ServerResponse::CantConnectToPeer { token: r.u32()? },
            ServerCode::SetWaitPort
            | ServerCode::UnwatchUser
            | ServerCode::SetStatus
            | ServerCode::ServerPing
            | ServerCode::SharedFoldersFiles
            | ServerCode::UserSearch
            | ServerCode::HaveNoParent
            | ServerCode::AcceptChildren
            | ServerCode::RoomSearch
            | ServerCode::SendUploadSpeed
            | ServerCode::BranchLevel
            | ServerCode::BranchRoot => {
                return Ok(Decoded::Unsupported {
                    code: raw.code,
                    consumed: raw.consumed,
                })
            }
        };

        Ok(Decoded::Message(message, raw.consumed))
    }
}
