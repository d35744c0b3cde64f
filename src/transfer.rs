//! Download and upload queues.
//!
//! Both queues are state machines over a shared [`TransferQueue`]:
//!
//! ```text
//! Queued -> Requesting -> Transferring -> Finished
//!    ^           |              |
//!    |           v              v
//!    +------ Failed(reason) / Cancelled / Denied(reason)
//! ```
//!
//! Neither queue performs I/O on sockets. Every handler receives a
//! [`QueueContext`] describing the world and appends the resulting network
//! commands and [`TransferEvent`]s to an [`Outbox`]. Timers (request
//! timeouts, retries, queue checks) live in a [`TimerWheel`] inside each
//! queue and fire from [`Uploads::poll`] and [`Downloads::poll`].

mod downloads;
mod error;
mod persistence;
mod queue;
mod record;
mod status;
mod timer;
mod uploads;

pub use downloads::Downloads;
pub use error::TransferError;
pub use persistence::{restore_downloads, restore_uploads};
pub use queue::{Bucket, TransferQueue};
pub use record::{Transfer, TransferKey};
pub use status::{is_internal_name, is_queue_limit_reason, FailureReason, TransferStatus};
pub use timer::{TimerId, TimerWheel};
pub use uploads::Uploads;

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::collaborator::{PermissionChecker, PermissionLevel, ShareIndex};
use crate::net::NetCommand;
use crate::protocol::{PeerMessage, ServerRequest, TextEncoding};
use crate::token::TokenGenerator;
use crate::users::UserDirectory;

/// Which queue a transfer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Download,
    Upload,
}

/// Order in which queued uploads are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Oldest queued file first.
    #[default]
    Fifo,
    /// The user who was served least recently first.
    RoundRobin,
}

/// Who may send us files we never queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteUploads {
    Nobody,
    Everyone,
    /// Buddies and trusted users.
    #[default]
    Buddies,
    Trusted,
}

impl RemoteUploads {
    /// Value of the UserInfoResponse upload permission field.
    pub fn wire_value(self) -> u32 {
        match self {
            RemoteUploads::Nobody => 0,
            RemoteUploads::Everyone => 1,
            RemoteUploads::Buddies => 2,
            RemoteUploads::Trusted => 3,
        }
    }

    pub fn allows(self, level: PermissionLevel) -> bool {
        match self {
            RemoteUploads::Nobody => false,
            RemoteUploads::Everyone => level != PermissionLevel::Banned,
            RemoteUploads::Buddies => {
                matches!(level, PermissionLevel::Buddy | PermissionLevel::Trusted)
            }
            RemoteUploads::Trusted => level == PermissionLevel::Trusted,
        }
    }
}

/// Changes reported to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Updated { kind: TransferKind, transfer: Transfer },
    Finished { kind: TransferKind, transfer: Transfer },
    /// Stopped before finishing: failed, cancelled, denied or paused.
    Aborted { kind: TransferKind, transfer: Transfer },
    Cleared { kind: TransferKind, transfer: Transfer },
}

impl TransferEvent {
    pub fn transfer(&self) -> &Transfer {
        match self {
            TransferEvent::Updated { transfer, .. }
            | TransferEvent::Finished { transfer, .. }
            | TransferEvent::Aborted { transfer, .. }
            | TransferEvent::Cleared { transfer, .. } => transfer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Change {
    Updated,
    Finished,
    Aborted,
    Cleared,
}

impl Change {
    pub(crate) fn event(self, kind: TransferKind, transfer: Transfer) -> TransferEvent {
        match self {
            Change::Updated => TransferEvent::Updated { kind, transfer },
            Change::Finished => TransferEvent::Finished { kind, transfer },
            Change::Aborted => TransferEvent::Aborted { kind, transfer },
            Change::Cleared => TransferEvent::Cleared { kind, transfer },
        }
    }
}

/// Everything a queue handler produced.
#[derive(Debug, Default)]
pub struct Outbox {
    pub commands: Vec<NetCommand>,
    pub events: Vec<TransferEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_peer(&mut self, user: &str, message: PeerMessage, encoding: TextEncoding) {
        self.commands.push(NetCommand::SendPeer {
            user: user.to_string(),
            message,
            encoding,
        });
    }

    pub fn send_server(&mut self, request: ServerRequest) {
        self.commands.push(NetCommand::SendServer(request));
    }

    pub fn command(&mut self, command: NetCommand) {
        self.commands.push(command);
    }

    pub fn event(&mut self, event: TransferEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty()
    }

    /// Peer messages queued for `user`, in order.
    pub fn peer_messages<'a>(
        &'a self,
        user: &'a str,
    ) -> impl Iterator<Item = &'a PeerMessage> + 'a {
        self.commands.iter().filter_map(move |command| match command {
            NetCommand::SendPeer { user: to, message, .. } if to == user => Some(message),
            _ => None,
        })
    }
}

/// The state queue handlers read but do not own.
pub struct QueueContext<'a> {
    pub shares: &'a dyn ShareIndex,
    pub permissions: &'a dyn PermissionChecker,
    pub users: &'a UserDirectory,
    pub tokens: &'a mut TokenGenerator,
    /// Current total upload speed in bytes per second.
    pub upload_speed: u64,
    pub shutting_down: bool,
    pub now: Instant,
}

/// Encoding for file paths sent to a peer.
pub(crate) fn path_encoding(legacy: bool) -> TextEncoding {
    if legacy {
        TextEncoding::Latin1
    } else {
        TextEncoding::Utf8
    }
}
