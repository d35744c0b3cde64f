use thiserror::Error;

/// Errors that can occur in the network engine.
#[derive(Debug, Error)]
pub enum NetError {
    /// Network or file I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent data that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    /// The socket limit is reached.
    #[error("socket limit of {0} reached")]
    SocketLimit(usize),

    /// The engine thread has stopped.
    #[error("network engine stopped")]
    EngineStopped,
}
