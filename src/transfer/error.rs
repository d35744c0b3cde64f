use thiserror::Error;

/// Errors raised by the transfer queues and their persistence.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Reading or writing a local file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted transfer list could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No transfer exists for this user and virtual path.
    #[error("no transfer for {user}: {virtual_path}")]
    NotFound { user: String, virtual_path: String },

    /// A download filter is not a valid regular expression.
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] regex::Error),
}
