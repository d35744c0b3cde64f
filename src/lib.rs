//! rslsk - Soulseek protocol and transfer engine
//!
//! This library implements the core of a Soulseek client: the binary wire
//! codec, a single-threaded socket multiplexer, and the download and upload
//! queues that turn file requests into completed, retried or failed
//! transfers.
//!
//! # Modules
//!
//! - [`protocol`] - Server, peer, distributed and file connection messages
//! - [`token`] - Request correlation tokens
//! - [`net`] - Socket multiplexer, peer connection setup, rate limiting
//! - [`transfer`] - Download and upload queue state machines
//! - [`users`] - Presence, privileges and addresses of other users
//! - [`collaborator`] - Share index, permission and persistence interfaces
//! - [`dispatch`] - Routes network events to the queues
//! - [`client`] - Network thread and command handle
//! - [`config`] - TOML configuration with environment overrides
//! - [`constants`] - Protocol constants and timer intervals

pub mod client;
pub mod collaborator;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod net;
pub mod protocol;
pub mod token;
pub mod transfer;
pub mod users;

pub use client::{Client, ClientError, ClientHandle};
pub use collaborator::{
    BanList, JsonTransferStore, PermissionChecker, PermissionLevel, ShareIndex, StaticShares,
    TransferStore,
};
pub use config::{Config, ConfigError, NetworkConfig, ServerConfig, TransferConfig};
pub use dispatch::{Collaborators, Core, CoreCommand, CoreEvent};
pub use net::{ConnId, NetCommand, NetError, NetEvent, NetHandle, NetworkEngine, ShapingPolicy};
pub use protocol::{
    decode, ConnectionType, Decoded, FrameKind, Message, PeerMessage, ProtocolError,
    ServerRequest, ServerResponse, TextEncoding,
};
pub use token::{TokenClass, TokenGenerator};
pub use transfer::{
    Downloads, FailureReason, QueueOrder, RemoteUploads, Transfer, TransferError, TransferEvent,
    TransferKind, TransferStatus, Uploads,
};
pub use users::UserDirectory;
