//! Client configuration.
//!
//! Configuration is read from a TOML file and then overridden by `RSLSK_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file at all) yields a working configuration.
//!
//! ```toml
//! [server]
//! username = "alice"
//! password = "secret"
//!
//! [network]
//! listen_port = 2234
//! upload_limit = 102400
//! upload_policy = "total_bandwidth"
//!
//! [transfers]
//! download_dir = "/home/alice/Downloads"
//! queue_order = "round_robin"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_LISTEN_PORT, DEFAULT_QUEUE_LIMIT_FILES, DEFAULT_QUEUE_LIMIT_MB, DEFAULT_SERVER_HOST,
    DEFAULT_SERVER_PORT, DEFAULT_UPLOAD_SLOTS, MAX_SOCKETS,
};
use crate::net::ShapingPolicy;
use crate::transfer::{QueueOrder, RemoteUploads};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for [`Config`].
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub network: NetworkConfig,
    pub transfers: TransferConfig,
    /// Directory holding the persisted transfer lists.
    pub state_dir: Option<PathBuf>,
}

/// Server address and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Sent to peers that ask for our user info.
    #[serde(default)]
    pub description: String,
}

fn default_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}
fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            username: String::new(),
            password: String::new(),
            description: String::new(),
        }
    }
}

/// Socket and bandwidth settings used by the network engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Port announced to the server with SetWaitPort.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    /// Upload limit in bytes per second, 0 for unlimited.
    #[serde(default)]
    pub upload_limit: u64,
    #[serde(default)]
    pub upload_policy: ShapingPolicy,
    /// Download limit in bytes per second, 0 for unlimited.
    #[serde(default)]
    pub download_limit: u64,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}
fn default_max_sockets() -> usize {
    MAX_SOCKETS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            max_sockets: default_max_sockets(),
            upload_limit: 0,
            upload_policy: ShapingPolicy::default(),
            download_limit: 0,
        }
    }
}

/// Transfer queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Where partial downloads are kept. Defaults to `download_dir`.
    #[serde(default)]
    pub incomplete_dir: Option<PathBuf>,
    #[serde(default = "default_upload_slots")]
    pub upload_slots: usize,
    /// Limit uploads by slot count. When false only the bandwidth limit applies.
    #[serde(default = "default_true")]
    pub use_upload_slots: bool,
    #[serde(default)]
    pub queue_order: QueueOrder,
    /// Queued files per user accepted from remote requests, 0 for no limit.
    #[serde(default = "default_queue_limit_files")]
    pub queue_limit_files: usize,
    /// Queued megabytes per user accepted from remote requests, 0 for no limit.
    #[serde(default = "default_queue_limit_mb")]
    pub queue_limit_mb: u64,
    /// With slots disabled, no new upload starts while total upload speed
    /// is at or above this many bytes per second.
    #[serde(default)]
    pub upload_bandwidth_limit: u64,
    #[serde(default)]
    pub autoclear_uploads: bool,
    #[serde(default)]
    pub autoclear_downloads: bool,
    /// Regular expressions matched against the virtual path of new downloads.
    #[serde(default)]
    pub download_filters: Vec<String>,
    #[serde(default)]
    pub enable_filters: bool,
    /// Who may send us files we did not ask for.
    #[serde(default)]
    pub remote_uploads: RemoteUploads,
    /// Where files sent to us unasked are saved, as `<dir>/<user>/<folder>`.
    /// Defaults to `<download_dir>/received`.
    #[serde(default)]
    pub received_dir: Option<PathBuf>,
}

fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}
fn default_upload_slots() -> usize {
    DEFAULT_UPLOAD_SLOTS
}
fn default_true() -> bool {
    true
}
fn default_queue_limit_files() -> usize {
    DEFAULT_QUEUE_LIMIT_FILES
}
fn default_queue_limit_mb() -> u64 {
    DEFAULT_QUEUE_LIMIT_MB
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            incomplete_dir: None,
            upload_slots: default_upload_slots(),
            use_upload_slots: default_true(),
            queue_order: QueueOrder::default(),
            queue_limit_files: default_queue_limit_files(),
            queue_limit_mb: default_queue_limit_mb(),
            upload_bandwidth_limit: 0,
            autoclear_uploads: false,
            autoclear_downloads: false,
            download_filters: Vec::new(),
            enable_filters: false,
            remote_uploads: RemoteUploads::default(),
            received_dir: None,
        }
    }
}

impl TransferConfig {
    pub fn incomplete_dir(&self) -> &Path {
        self.incomplete_dir.as_deref().unwrap_or(&self.download_dir)
    }

    pub fn received_dir(&self) -> PathBuf {
        self.received_dir
            .clone()
            .unwrap_or_else(|| self.download_dir.join("received"))
    }

    /// Per-user queued byte limit, 0 for no limit.
    pub fn queue_limit_bytes(&self) -> u64 {
        self.queue_limit_mb * 1024 * 1024
    }
}

impl Config {
    /// Parses a TOML document. Missing fields take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads configuration: defaults, then `path` if it exists, then the
    /// `RSLSK_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_toml(&std::fs::read_to_string(path)?)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("RSLSK_SERVER_HOST") {
            self.server.host = s;
        }
        if let Some(s) = lookup("RSLSK_SERVER_PORT") {
            self.server.port = parse_var("RSLSK_SERVER_PORT", &s)?;
        }
        if let Some(s) = lookup("RSLSK_USERNAME") {
            self.server.username = s;
        }
        if let Some(s) = lookup("RSLSK_PASSWORD") {
            self.server.password = s;
        }
        if let Some(s) = lookup("RSLSK_LISTEN_PORT") {
            self.network.listen_port = parse_var("RSLSK_LISTEN_PORT", &s)?;
        }
        if let Some(s) = lookup("RSLSK_UPLOAD_LIMIT") {
            self.network.upload_limit = parse_var("RSLSK_UPLOAD_LIMIT", &s)?;
        }
        if let Some(s) = lookup("RSLSK_DOWNLOAD_LIMIT") {
            self.network.download_limit = parse_var("RSLSK_DOWNLOAD_LIMIT", &s)?;
        }
        if let Some(s) = lookup("RSLSK_DOWNLOAD_DIR") {
            self.transfers.download_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("RSLSK_UPLOAD_SLOTS") {
            self.transfers.upload_slots = parse_var("RSLSK_UPLOAD_SLOTS", &s)?;
        }
        if let Some(s) = lookup("RSLSK_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(s));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, value)))
}
