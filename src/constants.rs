//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used throughout the engine: protocol
//! versions, framing bounds, socket and connection timeouts, transfer queue
//! timer intervals and bandwidth defaults.
//!
//! Timing values follow the behaviour of established Soulseek clients so that
//! peers see the retry and timeout cadence they expect.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client version sent in the Login message
pub const CLIENT_VERSION: u32 = 160;

/// Minor version sent in the Login message
pub const CLIENT_MINOR_VERSION: u32 = 1;

// ============================================================================
// Ports and addresses
// ============================================================================

/// Default Soulseek server host
pub const DEFAULT_SERVER_HOST: &str = "server.slsknet.org";

/// Default Soulseek server port
pub const DEFAULT_SERVER_PORT: u16 = 2242;

/// Default peer listen port
pub const DEFAULT_LISTEN_PORT: u16 = 2234;

// ============================================================================
// Framing
// ============================================================================

/// Largest accepted message payload. Share lists of big libraries can reach
/// tens of megabytes, anything beyond this is treated as malformed.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Largest accepted decompressed payload
pub const MAX_DECOMPRESSED_SIZE: usize = 512 * 1024 * 1024;

/// Initial read size for download file connections (100 KiB)
pub const INITIAL_DOWNLOAD_READ: usize = 100 * 1024;

/// Upper bound for the adaptive download read size
pub const MAX_DOWNLOAD_READ: usize = 8 * 1024 * 1024;

/// Read size for control connections (server, peer, distributed)
pub const CONTROL_READ_SIZE: usize = 64 * 1024;

/// Minimum file read-ahead for upload connections
pub const MIN_UPLOAD_READ_AHEAD: usize = 4096;

// ============================================================================
// Connection limits
// ============================================================================

/// Default cap on open sockets (server, peers, listener and pending connects)
pub const MAX_SOCKETS: usize = 3072;

// ============================================================================
// Timeouts - Connection
// ============================================================================

/// Outbound TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer and file connections without traffic for this long are closed
pub const CONNECTION_MAX_IDLE: Duration = Duration::from_secs(60);

/// Pending peer connections waiting for an indirect connection give up after this
pub const INDIRECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound of the readiness wait so housekeeping runs while idle
pub const LOOP_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Intervals - Network
// ============================================================================

/// Server keep-alive ping interval
pub const SERVER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection statistics emission interval
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum interval between progress events for one file connection
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Intervals - Transfer queues
// ============================================================================

/// Time a peer has to answer a TransferRequest
pub const TRANSFER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload queue re-evaluation interval
pub const UPLOAD_QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Retry interval for uploads and downloads that failed on the connection
pub const RETRY_FAILED_INTERVAL: Duration = Duration::from_secs(180);

/// Queue position refresh interval for queued downloads
pub const QUEUE_POSITION_INTERVAL: Duration = Duration::from_secs(180);

/// Retry interval for limited queues and local file errors
pub const RETRY_LIMITED_INTERVAL: Duration = Duration::from_secs(720);

/// Tick of the core dispatcher driving queue timers
pub const CORE_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Buffered core events per listener before the slowest one lags
pub const CORE_EVENT_CAPACITY: usize = 1024;

/// Changed transfer lists are written at most this often
pub const TRANSFER_SAVE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Queue limits
// ============================================================================

/// Files re-requested per user on each limited queue retry
pub const LIMITED_QUEUE_WINDOW: usize = 5;

/// Default upload slots
pub const DEFAULT_UPLOAD_SLOTS: usize = 2;

/// Default per-user queued file limit for remote requests
pub const DEFAULT_QUEUE_LIMIT_FILES: usize = 100;

/// Default per-user queued megabyte limit for remote requests
pub const DEFAULT_QUEUE_LIMIT_MB: u64 = 150;

// ============================================================================
// Bandwidth
// ============================================================================

/// Smallest per-connection upload rate once a limit is active (1 KiB/s)
pub const MIN_UPLOAD_RATE: u64 = 1024;

/// Weight of the newest sample in rolling speed averages
pub const RATE_SMOOTHING: f64 = 0.3;

// ============================================================================
// Tokens
// ============================================================================

/// Tokens are 31-bit values, the counter wraps back to 1 after this
pub const MAX_TOKEN: u32 = 0x7FFF_FFFF;
