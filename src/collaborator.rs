//! Interfaces to components outside the transfer engine.
//!
//! The engine does not index shares, decide who is banned, or choose where
//! transfer lists live. It asks these traits instead. Simple implementations
//! are provided for embedding and tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::transfer::{Transfer, TransferError, TransferKind};

/// Answers questions about shared files.
pub trait ShareIndex: Send + Sync {
    /// Size of `virtual_path` if it is shared with `user`.
    fn file_is_shared(&self, user: &str, virtual_path: &str) -> Option<u64>;

    /// Local path behind a virtual path.
    fn virtual_to_real_path(&self, virtual_path: &str) -> Option<PathBuf>;
}

/// How much a user is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    Banned,
    Public,
    Buddy,
    Trusted,
}

/// Decides whether a user may use our shares.
pub trait PermissionChecker: Send + Sync {
    /// Returns the level and, for bans, an optional message for the user.
    fn check_user_permission(
        &self,
        user: &str,
        ip: Option<IpAddr>,
    ) -> (PermissionLevel, Option<String>);
}

/// Saves and restores transfer lists.
pub trait TransferStore: Send {
    fn save(&self, kind: TransferKind, transfers: &[Transfer]) -> Result<(), TransferError>;

    /// Returns an empty list when nothing was saved yet.
    fn load(&self, kind: TransferKind) -> Result<Vec<Transfer>, TransferError>;
}

// ============================================================================
// Shares
// ============================================================================

/// Shares a fixed set of files, mapping virtual paths to local paths.
///
/// Sizes are read from the file system on every lookup, so a file that was
/// deleted or cannot be read is reported as not shared.
#[derive(Debug, Default)]
pub struct StaticShares {
    files: RwLock<HashMap<String, PathBuf>>,
}

impl StaticShares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, virtual_path: impl Into<String>, real_path: impl Into<PathBuf>) {
        self.files.write().insert(virtual_path.into(), real_path.into());
    }

    pub fn remove(&self, virtual_path: &str) {
        self.files.write().remove(virtual_path);
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl ShareIndex for StaticShares {
    fn file_is_shared(&self, _user: &str, virtual_path: &str) -> Option<u64> {
        let path = self.files.read().get(virtual_path).cloned()?;
        fs::metadata(path)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    fn virtual_to_real_path(&self, virtual_path: &str) -> Option<PathBuf> {
        self.files.read().get(virtual_path).cloned()
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// Grants public access to everyone except an explicit ban list.
#[derive(Debug, Default)]
pub struct BanList {
    banned: RwLock<HashMap<String, Option<String>>>,
    trusted: RwLock<HashSet<String>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&self, user: impl Into<String>, reason: Option<String>) {
        self.banned.write().insert(user.into(), reason);
    }

    pub fn unban(&self, user: &str) {
        self.banned.write().remove(user);
    }

    pub fn trust(&self, user: impl Into<String>) {
        self.trusted.write().insert(user.into());
    }
}

impl PermissionChecker for BanList {
    fn check_user_permission(
        &self,
        user: &str,
        _ip: Option<IpAddr>,
    ) -> (PermissionLevel, Option<String>) {
        if let Some(reason) = self.banned.read().get(user) {
            return (PermissionLevel::Banned, reason.clone());
        }
        if self.trusted.read().contains(user) {
            return (PermissionLevel::Trusted, None);
        }
        (PermissionLevel::Public, None)
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Stores transfer lists as JSON files in one directory.
///
/// Files are written to a temporary name first and renamed into place, so
/// a crash never leaves a truncated list behind.
#[derive(Debug, Clone)]
pub struct JsonTransferStore {
    dir: PathBuf,
}

impl JsonTransferStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: TransferKind) -> PathBuf {
        self.dir.join(match kind {
            TransferKind::Download => "downloads.json",
            TransferKind::Upload => "uploads.json",
        })
    }
}

impl TransferStore for JsonTransferStore {
    fn save(&self, kind: TransferKind, transfers: &[Transfer]) -> Result<(), TransferError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(kind);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(transfers)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), count = transfers.len(), "saved transfer list");
        Ok(())
    }

    fn load(&self, kind: TransferKind) -> Result<Vec<Transfer>, TransferError> {
        let path = self.path(kind);
        if !path.exists() {
            return Ok(Vec::new());
        }
        load_json(&path)
    }
}

fn load_json(path: &Path) -> Result<Vec<Transfer>, TransferError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
