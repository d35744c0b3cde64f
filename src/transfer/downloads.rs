use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::queue::TransferQueue;
use super::record::{Transfer, TransferKey};
use super::status::{is_queue_limit_reason, FailureReason, TransferStatus};
use super::timer::{TimerId, TimerWheel};
use super::{path_encoding, Change, Outbox, QueueContext, TransferKind};
use crate::config::TransferConfig;
use crate::constants::{
    LIMITED_QUEUE_WINDOW, QUEUE_POSITION_INTERVAL, RETRY_LIMITED_INTERVAL, TRANSFER_REQUEST_TIMEOUT,
};
use crate::net::{ConnId, NetCommand};
use crate::protocol::{PeerMessage, ServerRequest, TextEncoding, TransferReply};

#[derive(Debug, Clone, PartialEq, Eq)]
enum DownloadTimer {
    RequestTimeout(TransferKey, u32),
    /// Retries connection failures and refreshes queue positions.
    CheckQueue,
    /// Retries local file errors and a window of limited downloads.
    RetryLimited,
}

/// The download queue.
///
/// Downloads are requested with QueueUpload and then wait for the remote
/// user to offer them with a TransferRequest. Data is written to an
/// incomplete file and moved into the download folder once complete.
#[derive(Debug)]
pub struct Downloads {
    queue: TransferQueue,
    config: TransferConfig,
    filters: Vec<Regex>,
    timers: TimerWheel<DownloadTimer>,
    request_timers: HashMap<TransferKey, TimerId>,
    watched: HashSet<String>,
}

impl Downloads {
    /// Creates the queue. Filters that fail to compile are skipped.
    pub fn new(config: &TransferConfig) -> Self {
        let filters = config
            .download_filters
            .iter()
            .filter_map(|pattern| match compile_filter(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "ignoring download filter");
                    None
                }
            })
            .collect();
        Self {
            queue: TransferQueue::new(),
            config: config.clone(),
            filters,
            timers: TimerWheel::new(),
            request_timers: HashMap::new(),
            watched: HashSet::new(),
        }
    }

    pub fn set_config(&mut self, config: &TransferConfig) {
        self.config = config.clone();
    }

    /// Replaces the download filters. Nothing changes if any pattern is invalid.
    pub fn set_filters(&mut self, patterns: &[String]) -> Result<(), TransferError> {
        self.filters = patterns
            .iter()
            .map(|pattern| compile_filter(pattern))
            .collect::<Result<_, _>>()?;
        self.config.download_filters = patterns.to_vec();
        Ok(())
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn get(&self, user: &str, virtual_path: &str) -> Option<&Transfer> {
        self.queue.get(&TransferKey::new(user, virtual_path))
    }

    pub fn records(&self) -> Vec<Transfer> {
        self.queue.iter().cloned().collect()
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timers.next_deadline()
    }

    /// Adds previously saved records. See [`super::restore_downloads`].
    pub fn restore(&mut self, records: Vec<Transfer>) {
        for transfer in super::persistence::restore_downloads(records) {
            self.queue.insert(transfer);
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Starts the periodic timers and watches every user we still want
    /// files from. Called after logging in.
    pub fn start(&mut self, ctx: &QueueContext<'_>, out: &mut Outbox) {
        self.timers.clear();
        self.request_timers.clear();
        self.watched.clear();
        self.timers
            .schedule(ctx.now + QUEUE_POSITION_INTERVAL, DownloadTimer::CheckQueue);
        self.timers
            .schedule(ctx.now + RETRY_LIMITED_INTERVAL, DownloadTimer::RetryLimited);

        let users: Vec<String> = self
            .queue
            .iter()
            .filter(|t| !is_settled(&t.status))
            .map(|t| t.user.clone())
            .collect();
        for user in users {
            self.watch(&user, out);
        }
    }

    /// Every unfinished download waits for its user after a disconnect.
    pub fn on_disconnect(&mut self, out: &mut Outbox) {
        let keys: Vec<_> = self
            .queue
            .iter()
            .filter(|t| !is_settled(&t.status))
            .map(Transfer::key)
            .collect();
        for key in keys {
            self.fail(&key, TransferStatus::Failed(FailureReason::UserLoggedOff), out);
        }
        self.timers.clear();
        self.request_timers.clear();
        self.watched.clear();
    }

    fn watch(&mut self, user: &str, out: &mut Outbox) {
        if self.watched.insert(user.to_string()) {
            out.send_server(ServerRequest::WatchUser {
                user: user.to_string(),
            });
        }
    }

    // ========================================================================
    // Requesting
    // ========================================================================

    /// Adds a download, or requests an existing one again.
    ///
    /// A download that is already queued or running is left alone.
    pub fn enqueue(
        &mut self,
        user: &str,
        virtual_path: &str,
        folder_path: Option<PathBuf>,
        size: u64,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) -> TransferKey {
        let key = TransferKey::new(user, virtual_path);
        if self.queue.is_pending(&key) {
            debug!(user, virtual_path, "download already queued");
            return key;
        }
        if self.queue.contains(&key) {
            self.queue.modify(&key, |t| {
                if folder_path.is_some() {
                    t.folder_path = folder_path;
                }
                if size > 0 {
                    t.size = size;
                }
                t.legacy_attempt = false;
                t.retry_attempt = 0;
            });
        } else {
            let mut transfer = Transfer::new(user, virtual_path, size);
            transfer.folder_path = folder_path;
            self.queue.insert(transfer);
        }
        self.request(&key, false, ctx, out);
        key
    }

    /// Sends QueueUpload for `key`, unless the download is filtered, its
    /// user is offline or the file is already in the download folder.
    fn request(
        &mut self,
        key: &TransferKey,
        bypass_filter: bool,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        self.cancel_request_timer(key);
        self.watch(&key.user, out);
        let Some(conn) = self.queue.modify(key, |t| {
            let conn = t.conn;
            t.status = TransferStatus::Queued;
            t.limited = false;
            t.detach();
            conn
        }) else {
            return;
        };
        if let Some(conn) = conn {
            out.command(NetCommand::CloseConnection(conn));
        }

        if !bypass_filter && self.is_filtered(&key.virtual_path) {
            debug!(file = %key.virtual_path, "download filtered");
            self.queue.modify(key, |t| t.status = TransferStatus::Filtered);
            self.emit(key, Change::Aborted, out);
            self.auto_clear(key, out);
            return;
        }

        if ctx.users.is_offline(&key.user) {
            self.queue
                .modify(key, |t| t.status = TransferStatus::Failed(FailureReason::UserLoggedOff));
            self.emit(key, Change::Aborted, out);
            return;
        }

        if let Some(path) = self.queue.get(key).and_then(|t| self.complete_file(t)) {
            info!(file = %key.virtual_path, path = %path.display(), "already downloaded");
            let now = ctx.now;
            self.queue.modify(key, |t| t.finish(now));
            self.emit(key, Change::Finished, out);
            return;
        }

        let legacy = self.queue.get(key).is_some_and(|t| t.legacy_attempt);
        debug!(user = %key.user, file = %key.virtual_path, legacy, "queueing download");
        out.send_peer(
            &key.user,
            PeerMessage::QueueUpload {
                file: key.virtual_path.clone(),
            },
            path_encoding(legacy),
        );
        self.emit(key, Change::Updated, out);
    }

    fn is_filtered(&self, virtual_path: &str) -> bool {
        self.config.enable_filters && self.filters.iter().any(|regex| regex.is_match(virtual_path))
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// The uploader offers a file with TransferRequest.
    ///
    /// Only files we asked for are accepted.
    pub fn on_transfer_request(
        &mut self,
        user: &str,
        token: u32,
        virtual_path: &str,
        size: Option<u64>,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let status = self.queue.get(&key).map(|t| t.status.clone());
        let denial = match status {
            None => self.adopt_offer(&key, size, ctx, out),
            Some(TransferStatus::Finished) => Some("Complete"),
            Some(TransferStatus::Paused | TransferStatus::Filtered) => Some("Cancelled"),
            Some(_) => None,
        };

        let reply = match denial {
            Some(reason) => {
                debug!(user, token, virtual_path, reason, "refusing offered download");
                TransferReply::Denied {
                    reason: Some(reason.to_string()),
                }
            }
            None => {
                self.cancel_request_timer(&key);
                self.queue.modify(&key, |t| {
                    // Large files are announced with size 0 by some clients
                    if let Some(size) = size.filter(|&size| size > 0) {
                        if size != t.size {
                            t.size_changed = true;
                        }
                        t.size = size;
                    }
                    t.status = TransferStatus::Requesting;
                    t.limited = false;
                    t.token = Some(token);
                    t.queue_position = 0;
                });
                let id = self.timers.schedule(
                    ctx.now + TRANSFER_REQUEST_TIMEOUT,
                    DownloadTimer::RequestTimeout(key.clone(), token),
                );
                self.request_timers.insert(key.clone(), id);
                self.emit(&key, Change::Updated, out);
                TransferReply::Allowed { size: None }
            }
        };
        out.send_peer(
            user,
            PeerMessage::TransferResponse { token, reply },
            TextEncoding::Utf8,
        );
    }

    /// Takes in a file the peer offers without us having queued it.
    ///
    /// Returns the denial reason when the offer is refused.
    fn adopt_offer(
        &mut self,
        key: &TransferKey,
        size: Option<u64>,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) -> Option<&'static str> {
        let (level, _) = ctx
            .permissions
            .check_user_permission(&key.user, ctx.users.address(&key.user));
        if !self.config.remote_uploads.allows(level) {
            return Some("Cancelled");
        }

        let mut transfer = Transfer::new(&key.user, &key.virtual_path, size.unwrap_or(0));
        if self.complete_file(&transfer).is_some() {
            return Some("Complete");
        }

        let mut folder = self.config.received_dir().join(clean_name(&key.user));
        if let Some(parent) = parent_folder(&key.virtual_path) {
            folder.push(clean_name(parent));
        }
        info!(
            user = %key.user,
            file = %key.virtual_path,
            folder = %folder.display(),
            "accepting file sent by peer"
        );
        transfer.folder_path = Some(folder);
        self.queue.insert(transfer);
        self.watch(&key.user, out);
        None
    }

    /// The uploader opened a file connection for `token`.
    ///
    /// Returns false when no download owns the token.
    pub fn on_file_init(
        &mut self,
        conn: ConnId,
        user: &str,
        token: u32,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) -> bool {
        let Some(key) = self.queue.key_for_token(user, token) else {
            return false;
        };
        let Some(transfer) = self.queue.get(&key) else {
            return false;
        };
        if transfer.conn.is_some() {
            debug!(user, token, "download already has a file connection");
            out.command(NetCommand::CloseConnection(conn));
            return true;
        }
        let incomplete = self.incomplete_path(transfer);
        let size = transfer.size;
        let truncate = transfer.size_changed;
        self.cancel_request_timer(&key);

        let opened = open_incomplete(&incomplete, truncate);
        let (file, offset) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %incomplete.display(), error = %e, "cannot save download");
                out.command(NetCommand::CloseConnection(conn));
                self.fail(&key, TransferStatus::Failed(FailureReason::DownloadFolderError), out);
                return true;
            }
        };

        if offset >= size {
            drop(file);
            out.command(NetCommand::CloseConnection(conn));
            self.finish(&key, ctx, out);
            return true;
        }

        let now = ctx.now;
        self.queue.modify(&key, |t| {
            t.conn = Some(conn);
            t.size_changed = false;
            t.start(offset, now);
        });
        info!(user, file = %key.virtual_path, offset, size, "download started");
        out.command(NetCommand::AttachDownload {
            conn,
            token,
            file,
            offset,
            size,
        });
        self.emit(&key, Change::Updated, out);
        true
    }

    pub fn on_progress(
        &mut self,
        user: &str,
        token: u32,
        offset: u64,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let Some(key) = self.queue.key_for_token(user, token) else {
            return;
        };
        let now = ctx.now;
        let updated = self.queue.modify(&key, |t| {
            if t.status != TransferStatus::Transferring {
                return false;
            }
            t.record_progress(offset, None, now);
            true
        });
        if updated == Some(true) {
            self.emit(&key, Change::Updated, out);
        }
    }

    pub fn on_connection_closed(
        &mut self,
        user: &str,
        token: u32,
        offset: u64,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let Some(key) = self.queue.key_for_token(user, token) else {
            return;
        };
        let now = ctx.now;
        let Some(size) = self.queue.modify(&key, |t| {
            t.conn = None;
            if t.status == TransferStatus::Transferring {
                t.record_progress(offset, None, now);
            }
            t.size
        }) else {
            return;
        };

        if offset >= size {
            self.finish(&key, ctx, out);
        } else if ctx.users.is_offline(user) {
            self.fail(&key, TransferStatus::Failed(FailureReason::UserLoggedOff), out);
        } else {
            self.fail(&key, TransferStatus::Failed(FailureReason::ConnectionClosed), out);
        }
    }

    pub fn on_file_error(&mut self, user: &str, token: u32, error: &str, out: &mut Outbox) {
        let Some(key) = self.queue.key_for_token(user, token) else {
            return;
        };
        warn!(user, token, error, "download file error");
        self.fail(&key, TransferStatus::Failed(FailureReason::LocalFileError), out);
    }

    // ========================================================================
    // Peer replies
    // ========================================================================

    /// The uploader refused our QueueUpload.
    pub fn on_upload_denied(
        &mut self,
        user: &str,
        virtual_path: &str,
        reason: &str,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let Some(transfer) = self.queue.get(&key) else {
            return;
        };
        // Some clients send this for finished files when unsharing them
        if matches!(transfer.status, TransferStatus::Finished | TransferStatus::Paused) {
            return;
        }

        if reason == "File not shared." && !transfer.legacy_attempt {
            info!(user, virtual_path, "file not shared, asking again with legacy encoding");
            self.queue.modify(&key, |t| t.legacy_attempt = true);
            self.request(&key, true, ctx, out);
            return;
        }

        if is_queue_limit_reason(reason) {
            debug!(user, virtual_path, reason, "download limited by peer");
            self.cancel_request_timer(&key);
            self.queue.modify(&key, |t| {
                t.status = TransferStatus::Queued;
                t.detach();
                t.limited = true;
            });
            self.emit(&key, Change::Updated, out);
            return;
        }

        info!(user, virtual_path, reason, "download denied");
        self.fail(&key, TransferStatus::from_peer_reason(reason), out);
    }

    /// The uploader could not start or complete the upload.
    pub fn on_upload_failed(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let Some(transfer) = self.queue.get(&key) else {
            return;
        };
        let ignored = matches!(
            transfer.status,
            TransferStatus::Finished
                | TransferStatus::Paused
                | TransferStatus::Failed(
                    FailureReason::DownloadFolderError
                        | FailureReason::LocalFileError
                        | FailureReason::UserLoggedOff
                )
        );
        if ignored {
            return;
        }

        if !transfer.legacy_attempt {
            self.queue.modify(&key, |t| t.legacy_attempt = true);
            self.request(&key, true, ctx, out);
        } else {
            self.fail(&key, TransferStatus::Failed(FailureReason::ConnectionClosed), out);
        }
    }

    pub fn on_place_in_queue_response(
        &mut self,
        user: &str,
        virtual_path: &str,
        place: u32,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let updated = self.queue.modify(&key, |t| {
            if t.status != TransferStatus::Queued {
                return false;
            }
            t.queue_position = place;
            true
        });
        if updated == Some(true) {
            self.emit(&key, Change::Updated, out);
        }
    }

    /// No connection to `user` could be opened for our QueueUpload messages.
    pub fn on_peer_connection_error(
        &mut self,
        user: &str,
        undelivered: &[PeerMessage],
        offline: bool,
        out: &mut Outbox,
    ) {
        let reason = if offline {
            FailureReason::UserLoggedOff
        } else {
            FailureReason::ConnectionTimeout
        };
        for message in undelivered {
            let PeerMessage::QueueUpload { file } = message else {
                continue;
            };
            let key = TransferKey::new(user, file.as_str());
            if self.queue.get(&key).is_some_and(|t| t.status == TransferStatus::Queued) {
                debug!(user, file = %file, ?reason, "cannot reach uploader");
                self.fail(&key, TransferStatus::Failed(reason), out);
            }
        }
    }

    /// Offline users fail their waiting downloads. Users coming back are
    /// asked again for downloads that failed because they were gone.
    pub fn on_user_status(
        &mut self,
        user: &str,
        online: bool,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let keys = self.queue.keys_for(user);
        for key in keys {
            let Some(status) = self.queue.get(&key).map(|t| t.status.clone()) else {
                continue;
            };
            if online {
                if status == TransferStatus::Failed(FailureReason::UserLoggedOff) {
                    self.request(&key, false, ctx, out);
                }
            } else if waits_for_user(&status) {
                self.fail(&key, TransferStatus::Failed(FailureReason::UserLoggedOff), out);
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub fn poll(&mut self, ctx: &QueueContext<'_>, out: &mut Outbox) {
        let now = ctx.now;
        for timer in self.timers.expired(now) {
            match timer {
                DownloadTimer::RequestTimeout(key, token) => {
                    self.request_timers.remove(&key);
                    let waiting = self
                        .queue
                        .get(&key)
                        .is_some_and(|t| {
                            t.status == TransferStatus::Requesting && t.token == Some(token)
                        });
                    if waiting {
                        info!(
                            user = %key.user,
                            file = %key.virtual_path,
                            "download request timed out"
                        );
                        let status = TransferStatus::Failed(FailureReason::ConnectionTimeout);
                        self.fail(&key, status, out);
                    }
                }
                DownloadTimer::CheckQueue => {
                    self.timers
                        .schedule(now + QUEUE_POSITION_INTERVAL, DownloadTimer::CheckQueue);
                    self.check_queue(ctx, out);
                }
                DownloadTimer::RetryLimited => {
                    self.timers
                        .schedule(now + RETRY_LIMITED_INTERVAL, DownloadTimer::RetryLimited);
                    self.retry_limited(ctx, out);
                }
            }
        }
    }

    /// Retries connection failures and asks for the position of every
    /// queued download.
    pub fn check_queue(&mut self, ctx: &QueueContext<'_>, out: &mut Outbox) {
        for key in self.queue.failed_keys() {
            let retry = self
                .queue
                .get(&key)
                .and_then(|t| t.status.failure())
                .is_some_and(FailureReason::is_connection_failure);
            if retry {
                self.queue.modify(&key, |t| t.retry_attempt += 1);
                self.request(&key, false, ctx, out);
            }
        }

        let queued: Vec<_> = self.queue.queued().cloned().collect();
        for key in queued {
            let Some(transfer) = self.queue.get(&key) else {
                continue;
            };
            if transfer.limited {
                continue;
            }
            out.send_peer(
                &key.user,
                PeerMessage::PlaceInQueueRequest {
                    file: key.virtual_path.clone(),
                },
                path_encoding(transfer.legacy_attempt),
            );
        }
    }

    /// Retries local file errors, and re-requests up to
    /// [`LIMITED_QUEUE_WINDOW`] limited downloads per user.
    pub fn retry_limited(&mut self, ctx: &QueueContext<'_>, out: &mut Outbox) {
        for key in self.queue.failed_keys() {
            let local = self.queue.get(&key).and_then(|t| t.status.failure())
                == Some(FailureReason::LocalFileError);
            if local {
                self.queue.modify(&key, |t| t.retry_attempt += 1);
                self.request(&key, false, ctx, out);
            }
        }

        let mut limited: BTreeMap<String, Vec<TransferKey>> = BTreeMap::new();
        for key in self.queue.queued() {
            if self.queue.get(key).is_some_and(|t| t.limited) {
                limited.entry(key.user.clone()).or_default().push(key.clone());
            }
        }
        for (_, keys) in limited {
            for key in keys.into_iter().take(LIMITED_QUEUE_WINDOW) {
                self.request(&key, false, ctx, out);
            }
        }
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Pauses a download.
    pub fn abort(&mut self, user: &str, virtual_path: &str, out: &mut Outbox) {
        let key = TransferKey::new(user, virtual_path);
        let settled = self
            .queue
            .get(&key)
            .map_or(true, |t| {
                matches!(t.status, TransferStatus::Finished | TransferStatus::Paused)
            });
        if !settled {
            self.fail(&key, TransferStatus::Paused, out);
        }
    }

    /// Requests a stopped download again. A filtered download bypasses the
    /// filters on an explicit retry.
    pub fn retry(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let Some(status) = self.queue.get(&key).map(|t| t.status.clone()) else {
            return;
        };
        if matches!(status, TransferStatus::Transferring | TransferStatus::Finished) {
            return;
        }
        self.queue.modify(&key, |t| {
            t.legacy_attempt = false;
            t.retry_attempt = 0;
        });
        self.request(&key, status == TransferStatus::Filtered, ctx, out);
    }

    pub fn clear(&mut self, user: &str, virtual_path: &str, out: &mut Outbox) {
        let key = TransferKey::new(user, virtual_path);
        if self.queue.is_pending(&key) {
            self.fail(&key, TransferStatus::Paused, out);
        }
        self.remove(&key, out);
    }

    pub fn clear_finished(&mut self, out: &mut Outbox) {
        let finished: Vec<_> = self
            .queue
            .iter()
            .filter(|t| t.status == TransferStatus::Finished)
            .map(Transfer::key)
            .collect();
        for key in finished {
            self.remove(&key, out);
        }
    }

    // ========================================================================
    // Files
    // ========================================================================

    fn folder(&self, transfer: &Transfer) -> PathBuf {
        transfer
            .folder_path
            .clone()
            .unwrap_or_else(|| self.config.download_dir.clone())
    }

    /// Where data is kept until the download completes. The name is unique
    /// per user and virtual path.
    pub fn incomplete_path(&self, transfer: &Transfer) -> PathBuf {
        let digest = Md5::digest(format!("{}{}", transfer.virtual_path, transfer.user).as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.config
            .incomplete_dir()
            .join(format!("INCOMPLETE{}{}", hex, clean_name(transfer.basename())))
    }

    /// A file in the download folder with the expected name and size.
    fn complete_file(&self, transfer: &Transfer) -> Option<PathBuf> {
        if transfer.size == 0 {
            return None;
        }
        let folder = self.folder(transfer);
        let name = clean_name(transfer.basename());
        (0..)
            .map(|n| folder.join(numbered_name(&name, n)))
            .take_while(|path| path.is_file())
            .find(|path| fs::metadata(path).is_ok_and(|meta| meta.len() == transfer.size))
    }

    fn finish(&mut self, key: &TransferKey, ctx: &QueueContext<'_>, out: &mut Outbox) {
        self.cancel_request_timer(key);
        let Some(transfer) = self.queue.get(key) else {
            return;
        };
        let incomplete = self.incomplete_path(transfer);
        let folder = self.folder(transfer);
        let name = clean_name(transfer.basename());

        let moved = fs::create_dir_all(&folder).and_then(|()| {
            let target = free_path(&folder, &name);
            move_file(&incomplete, &target).map(|()| target)
        });
        match moved {
            Ok(target) => {
                info!(user = %key.user, path = %target.display(), "download finished");
                let now = ctx.now;
                self.queue.modify(key, |t| t.finish(now));
                self.emit(key, Change::Finished, out);
                self.auto_clear(key, out);
            }
            Err(e) => {
                warn!(folder = %folder.display(), error = %e, "cannot move finished download");
                self.fail(key, TransferStatus::Failed(FailureReason::DownloadFolderError), out);
            }
        }
    }

    // ========================================================================
    // State changes
    // ========================================================================

    fn fail(&mut self, key: &TransferKey, status: TransferStatus, out: &mut Outbox) {
        self.cancel_request_timer(key);
        let Some(conn) = self.queue.modify(key, |t| {
            let conn = t.conn;
            t.status = status;
            t.limited = false;
            t.size_changed = false;
            t.detach();
            conn
        }) else {
            return;
        };
        if let Some(conn) = conn {
            out.command(NetCommand::CloseConnection(conn));
        }
        self.emit(key, Change::Aborted, out);
    }

    fn auto_clear(&mut self, key: &TransferKey, out: &mut Outbox) {
        if self.config.autoclear_downloads {
            self.remove(key, out);
        }
    }

    fn remove(&mut self, key: &TransferKey, out: &mut Outbox) {
        self.cancel_request_timer(key);
        if let Some(transfer) = self.queue.remove(key) {
            out.event(Change::Cleared.event(TransferKind::Download, transfer));
        }
    }

    fn cancel_request_timer(&mut self, key: &TransferKey) {
        if let Some(id) = self.request_timers.remove(key) {
            self.timers.cancel(id);
        }
    }

    fn emit(&self, key: &TransferKey, change: Change, out: &mut Outbox) {
        if let Some(transfer) = self.queue.get(key) {
            out.event(change.event(TransferKind::Download, transfer.clone()));
        }
    }
}

fn compile_filter(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Statuses a download keeps across disconnects and presence changes.
fn is_settled(status: &TransferStatus) -> bool {
    matches!(
        status,
        TransferStatus::Finished | TransferStatus::Filtered | TransferStatus::Paused
    )
}

/// Statuses that turn into `User logged off` when the user goes offline.
fn waits_for_user(status: &TransferStatus) -> bool {
    match status {
        TransferStatus::Queued | TransferStatus::Requesting | TransferStatus::Cancelled => true,
        TransferStatus::Failed(reason) => reason.is_connection_failure(),
        TransferStatus::Denied(reason) => {
            is_queue_limit_reason(reason) || reason == "Pending shutdown."
        }
        _ => false,
    }
}

fn open_incomplete(path: &Path, truncate: bool) -> io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
    if truncate {
        file.set_len(0)?;
    }
    let offset = file.metadata()?.len();
    Ok((file, offset))
}

/// Replaces characters that are not allowed in file names.
/// Name of the folder holding `virtual_path`, if it has one.
fn parent_folder(virtual_path: &str) -> Option<&str> {
    let mut parts = virtual_path.rsplit(|c: char| c == '\\' || c == '/');
    parts.next()?;
    parts.next().filter(|parent| !parent.is_empty())
}

fn clean_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

/// `name`, `name (1)`, `name (2)`, ... keeping the extension last.
fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{} ({})", name, n),
    }
}

/// The first numbered variant of `name` that does not exist in `folder`.
fn free_path(folder: &Path, name: &str) -> PathBuf {
    (0..)
        .map(|n| folder.join(numbered_name(name, n)))
        .find(|path| !path.exists())
        .unwrap_or_else(|| folder.join(name))
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Across file systems rename fails; copy instead
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

