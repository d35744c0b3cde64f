use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a transfer stopped without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    UserLoggedOff,
    ConnectionClosed,
    ConnectionTimeout,
    /// Reading or writing the local file failed.
    LocalFileError,
    /// The download folder could not be created or written.
    DownloadFolderError,
    RemoteFileError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::UserLoggedOff => "User logged off",
            FailureReason::ConnectionClosed => "Connection closed",
            FailureReason::ConnectionTimeout => "Connection timeout",
            FailureReason::LocalFileError => "Local file error",
            FailureReason::DownloadFolderError => "Download folder error",
            FailureReason::RemoteFileError => "Remote file error",
        }
    }

    /// Failures retried by the short retry timer.
    pub fn is_connection_failure(self) -> bool {
        matches!(
            self,
            FailureReason::ConnectionClosed | FailureReason::ConnectionTimeout
        )
    }
}

/// State of a single transfer.
///
/// Statuses are persisted and shown to users by their display name, so
/// serialization goes through [`TransferStatus::name`] and
/// [`TransferStatus::from_name`]. Names that are not known statuses are
/// rejection reasons supplied by a peer and end up in [`TransferStatus::Denied`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransferStatus {
    Queued,
    /// Waiting for the peer to answer a transfer request.
    Requesting,
    Transferring,
    Finished,
    Paused,
    Filtered,
    Cancelled,
    Failed(FailureReason),
    /// Rejected by the peer with a reason of its own.
    Denied(String),
}

const FAILURES: [FailureReason; 6] = [
    FailureReason::UserLoggedOff,
    FailureReason::ConnectionClosed,
    FailureReason::ConnectionTimeout,
    FailureReason::LocalFileError,
    FailureReason::DownloadFolderError,
    FailureReason::RemoteFileError,
];

impl TransferStatus {
    pub fn name(&self) -> &str {
        match self {
            TransferStatus::Queued => "Queued",
            TransferStatus::Requesting => "Getting status",
            TransferStatus::Transferring => "Transferring",
            TransferStatus::Finished => "Finished",
            TransferStatus::Paused => "Paused",
            TransferStatus::Filtered => "Filtered",
            TransferStatus::Cancelled => "Cancelled",
            TransferStatus::Failed(reason) => reason.as_str(),
            TransferStatus::Denied(reason) => reason,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "Queued" => TransferStatus::Queued,
            "Getting status" => TransferStatus::Requesting,
            "Transferring" => TransferStatus::Transferring,
            "Finished" => TransferStatus::Finished,
            "Paused" => TransferStatus::Paused,
            "Filtered" => TransferStatus::Filtered,
            "Cancelled" => TransferStatus::Cancelled,
            other => FAILURES
                .iter()
                .find(|reason| reason.as_str() == other)
                .map(|reason| TransferStatus::Failed(*reason))
                .unwrap_or_else(|| TransferStatus::Denied(other.to_string())),
        }
    }

    /// Maps a rejection reason sent by a peer to a status.
    ///
    /// Peers may not impersonate our own progress states, so a reason equal
    /// to one of them becomes `Cancelled`.
    pub fn from_peer_reason(reason: &str) -> Self {
        if is_internal_name(reason) {
            return TransferStatus::Cancelled;
        }
        Self::from_name(reason)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TransferStatus::Requesting | TransferStatus::Transferring)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TransferStatus::Failed(_) | TransferStatus::Denied(_))
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            TransferStatus::Failed(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Whether `reason` names one of our own progress states.
pub fn is_internal_name(reason: &str) -> bool {
    matches!(
        reason,
        "Getting status" | "Transferring" | "Paused" | "Filtered" | "User logged off" | "Finished"
    )
}

/// Whether a peer rejected a request because a per-user queue limit was hit.
pub fn is_queue_limit_reason(reason: &str) -> bool {
    reason == "Too many files"
        || reason == "Too many megabytes"
        || reason.starts_with("User limit of")
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for TransferStatus {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<TransferStatus> for String {
    fn from(status: TransferStatus) -> Self {
        status.name().to_string()
    }
}
