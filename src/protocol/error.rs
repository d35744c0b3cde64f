use thiserror::Error;

/// Errors produced while decoding wire messages.
///
/// Returned from [`decode`](super::decode) only for framing faults, which are
/// connection-fatal. Payload faults inside a complete frame surface as
/// [`Decoded::Malformed`](super::Decoded::Malformed) instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A field extends past the end of the declared payload.
    #[error("truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The declared frame length is not usable.
    #[error("invalid frame length: {0}")]
    InvalidLength(usize),

    /// A field carries a value outside its domain.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A zlib payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Payload could not be deflated.
    #[error("compression failed: {0}")]
    Compress(#[from] std::io::Error),
}
