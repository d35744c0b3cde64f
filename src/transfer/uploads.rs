use std::collections::HashMap;
use std::fs::File;

use tracing::{debug, info, warn};

use super::queue::TransferQueue;
use super::record::{Transfer, TransferKey};
use super::status::{FailureReason, TransferStatus};
use super::timer::{TimerId, TimerWheel};
use super::{path_encoding, Change, Outbox, QueueContext, QueueOrder, TransferKind};
use crate::collaborator::PermissionLevel;
use crate::config::TransferConfig;
use crate::constants::{
    RETRY_FAILED_INTERVAL, RETRY_LIMITED_INTERVAL, TRANSFER_REQUEST_TIMEOUT,
    UPLOAD_QUEUE_CHECK_INTERVAL,
};
use crate::net::{ConnId, NetCommand};
use crate::protocol::{PeerMessage, ServerRequest, TextEncoding, TransferDirection, TransferReply};
use crate::token::TokenClass;

#[derive(Debug, Clone, PartialEq, Eq)]
enum UploadTimer {
    RequestTimeout(TransferKey, u32),
    CheckQueue,
    RetryFailed,
    RetryLocalErrors,
}

/// Outcome of the admission checks for a remote request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Admission {
    Accept { size: u64 },
    /// Already queued or active, nothing to do.
    Duplicate,
    Deny(String),
}

/// The upload queue.
///
/// Remote users queue files with QueueUpload. Whenever a slot is free the
/// next candidate is picked according to [`QueueOrder`], privileged users
/// first, and offered to its user with a TransferRequest.
#[derive(Debug)]
pub struct Uploads {
    queue: TransferQueue,
    config: TransferConfig,
    timers: TimerWheel<UploadTimer>,
    request_timers: HashMap<TransferKey, TimerId>,
    /// Round-robin ordering: users with lower values are served first.
    user_counters: HashMap<String, u64>,
    counter_seq: u64,
    /// Positions last reported to users that asked for them.
    reported_positions: HashMap<TransferKey, u32>,
}

impl Uploads {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            queue: TransferQueue::new(),
            config: config.clone(),
            timers: TimerWheel::new(),
            request_timers: HashMap::new(),
            user_counters: HashMap::new(),
            counter_seq: 0,
            reported_positions: HashMap::new(),
        }
    }

    pub fn set_config(&mut self, config: &TransferConfig) {
        self.config = config.clone();
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn get(&self, user: &str, virtual_path: &str) -> Option<&Transfer> {
        self.queue.get(&TransferKey::new(user, virtual_path))
    }

    /// Records worth persisting.
    pub fn records(&self) -> Vec<Transfer> {
        self.queue.iter().cloned().collect()
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timers.next_deadline()
    }

    /// Adds previously saved records. Only finished uploads are kept.
    pub fn restore(&mut self, records: Vec<Transfer>) {
        for transfer in super::persistence::restore_uploads(records) {
            self.queue.insert(transfer);
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Starts the periodic queue timers. Called after logging in.
    pub fn start(&mut self, ctx: &mut QueueContext<'_>, out: &mut Outbox) {
        self.timers.clear();
        self.request_timers.clear();
        let now = ctx.now;
        self.timers.schedule(now + UPLOAD_QUEUE_CHECK_INTERVAL, UploadTimer::CheckQueue);
        self.timers.schedule(now + RETRY_FAILED_INTERVAL, UploadTimer::RetryFailed);
        self.timers.schedule(now + RETRY_LIMITED_INTERVAL, UploadTimer::RetryLocalErrors);
        self.check_queue(ctx, out);
    }

    /// Every upload in progress is lost with the server connection.
    pub fn on_disconnect(&mut self, out: &mut Outbox) {
        for key in self.queue.active_keys() {
            self.fail(&key, TransferStatus::Failed(FailureReason::UserLoggedOff), out);
        }
        self.timers.clear();
        self.request_timers.clear();
        self.reported_positions.clear();
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    /// Queues `virtual_path` for `user` on our own initiative.
    ///
    /// Queue limits do not apply to local pushes. The user is told that a
    /// file is waiting with UploadQueueNotification.
    pub fn push_file(
        &mut self,
        user: &str,
        virtual_path: &str,
        size: Option<u64>,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) -> TransferKey {
        let key = TransferKey::new(user, virtual_path);
        if self.queue.is_pending(&key) {
            debug!(user, virtual_path, "upload already queued");
            return key;
        }
        let size = size
            .or_else(|| ctx.shares.file_is_shared(user, virtual_path))
            .unwrap_or(0);

        if ctx.users.is_offline(user) {
            let mut transfer = self
                .queue
                .remove(&key)
                .unwrap_or_else(|| Transfer::new(user, virtual_path, size));
            transfer.size = size;
            transfer.status = TransferStatus::Failed(FailureReason::UserLoggedOff);
            transfer.detach();
            self.queue.insert(transfer);
            self.emit(&key, Change::Aborted, out);
            return key;
        }

        self.enqueue(&key, size, out);
        out.send_peer(user, PeerMessage::UploadQueueNotification, TextEncoding::Utf8);
        self.check_queue(ctx, out);
        key
    }

    /// Handles a QueueUpload request from `user`.
    pub fn on_queue_upload(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        match self.admit(user, virtual_path, ctx) {
            Admission::Accept { size } => {
                info!(user, virtual_path, "upload queued");
                let key = TransferKey::new(user, virtual_path);
                self.enqueue(&key, size, out);
                self.check_queue(ctx, out);
            }
            Admission::Duplicate => {}
            Admission::Deny(reason) => {
                debug!(user, virtual_path, %reason, "upload denied");
                out.send_peer(
                    user,
                    PeerMessage::UploadDenied {
                        file: virtual_path.to_string(),
                        reason,
                    },
                    TextEncoding::Utf8,
                );
            }
        }
    }

    /// Handles a TransferRequest from an old client asking us to upload.
    ///
    /// The request runs the same admission checks as QueueUpload. Accepted
    /// files join the queue and are offered later like any other upload.
    pub fn on_transfer_request(
        &mut self,
        user: &str,
        token: u32,
        virtual_path: &str,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let reason = match self.admit(user, virtual_path, ctx) {
            Admission::Accept { size } => {
                self.enqueue(&TransferKey::new(user, virtual_path), size, out);
                "Queued".to_string()
            }
            Admission::Duplicate => "Queued".to_string(),
            Admission::Deny(reason) => reason,
        };
        out.send_peer(
            user,
            PeerMessage::TransferResponse {
                token,
                reply: TransferReply::Denied {
                    reason: Some(reason),
                },
            },
            TextEncoding::Utf8,
        );
        self.check_queue(ctx, out);
    }

    fn admit(&self, user: &str, virtual_path: &str, ctx: &QueueContext<'_>) -> Admission {
        let (level, ban_reason) = ctx
            .permissions
            .check_user_permission(user, ctx.users.address(user));
        if level == PermissionLevel::Banned {
            return Admission::Deny(match ban_reason {
                Some(reason) if !reason.is_empty() => format!("Banned ({})", reason),
                _ => "Banned".to_string(),
            });
        }

        if self.queue.is_pending(&TransferKey::new(user, virtual_path)) {
            return Admission::Duplicate;
        }

        if ctx.shutting_down {
            return Admission::Deny("Pending shutdown.".to_string());
        }

        if level < PermissionLevel::Trusted {
            let file_limit = self.config.queue_limit_files;
            if file_limit > 0 && self.queue.queued_count(user) >= file_limit {
                return Admission::Deny("Too many files".to_string());
            }
            let byte_limit = self.config.queue_limit_bytes();
            if byte_limit > 0 && self.queue.queued_bytes(user) >= byte_limit {
                return Admission::Deny("Too many megabytes".to_string());
            }
        }

        let Some(size) = ctx.shares.file_is_shared(user, virtual_path) else {
            return Admission::Deny("File not shared.".to_string());
        };

        let readable = ctx
            .shares
            .virtual_to_real_path(virtual_path)
            .is_some_and(|path| File::open(path).is_ok());
        if !readable {
            return Admission::Deny("File read error.".to_string());
        }

        Admission::Accept { size }
    }

    fn enqueue(&mut self, key: &TransferKey, size: u64, out: &mut Outbox) {
        let mut transfer = self
            .queue
            .remove(key)
            .unwrap_or_else(|| Transfer::new(&key.user, &key.virtual_path, size));
        transfer.size = size;
        transfer.current_byte_offset = 0;
        transfer.status = TransferStatus::Queued;
        transfer.retry_attempt = 0;
        transfer.detach();
        self.queue.insert(transfer);
        self.emit(key, Change::Updated, out);
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Starts as many queued uploads as the limits allow.
    pub fn check_queue(&mut self, ctx: &mut QueueContext<'_>, out: &mut Outbox) {
        if ctx.shutting_down {
            return;
        }
        let mut started = false;
        while self.allow_new_upload(ctx) {
            let Some(key) = self.candidate(ctx) else {
                break;
            };
            self.activate(&key, ctx, out);
            started = true;
        }
        if started {
            self.push_positions(ctx, out);
        }
    }

    fn allow_new_upload(&self, ctx: &QueueContext<'_>) -> bool {
        if self.config.use_upload_slots && self.queue.active_count() >= self.config.upload_slots {
            return false;
        }
        let bandwidth = self.config.upload_bandwidth_limit;
        !(bandwidth > 0 && ctx.upload_speed >= bandwidth)
    }

    /// The next transfer to offer, if any.
    ///
    /// Users with an upload in progress or known to be offline are skipped.
    /// While any eligible user is privileged, only privileged users are
    /// considered.
    pub fn candidate(&self, ctx: &QueueContext<'_>) -> Option<TransferKey> {
        let eligible = |user: &str| !self.queue.is_user_active(user) && !ctx.users.is_offline(user);
        let privileged_waiting = self
            .queue
            .queued_users()
            .any(|user| eligible(user) && ctx.users.is_privileged(user));
        let allowed = |user: &str| {
            eligible(user) && (!privileged_waiting || ctx.users.is_privileged(user))
        };

        match self.config.queue_order {
            QueueOrder::Fifo => self.queue.queued().find(|key| allowed(&key.user)).cloned(),
            QueueOrder::RoundRobin => {
                let user = self
                    .queue
                    .queued_users()
                    .filter(|user| allowed(*user))
                    .min_by_key(|user| {
                        (self.user_counters.get(*user).copied().unwrap_or(0), *user)
                    })?;
                let path = self.queue.queued_for(user).next()?;
                Some(TransferKey::new(user, path.as_str()))
            }
        }
    }

    fn activate(&mut self, key: &TransferKey, ctx: &mut QueueContext<'_>, out: &mut Outbox) {
        let token = ctx.tokens.next(TokenClass::Upload);
        let Some((size, legacy)) = self.queue.modify(key, |t| {
            t.status = TransferStatus::Requesting;
            t.token = Some(token);
            t.queue_position = 0;
            (t.size, t.legacy_attempt)
        }) else {
            return;
        };
        info!(user = %key.user, file = %key.virtual_path, token, "requesting upload");

        out.send_peer(
            &key.user,
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token,
                file: key.virtual_path.clone(),
                size: Some(size),
            },
            path_encoding(legacy),
        );
        let id = self.timers.schedule(
            ctx.now + TRANSFER_REQUEST_TIMEOUT,
            UploadTimer::RequestTimeout(key.clone(), token),
        );
        self.request_timers.insert(key.clone(), id);
        self.reported_positions.remove(key);
        self.touch_user(key);
        self.emit(key, Change::Updated, out);
    }

    /// Moves the user to the back of the round-robin order.
    ///
    /// Queueing more files does not push a user back, and progress updates
    /// during a transfer do not count as activity.
    fn touch_user(&mut self, key: &TransferKey) {
        let Some(transfer) = self.queue.get(key) else {
            return;
        };
        if transfer.status == TransferStatus::Queued && self.user_counters.contains_key(&key.user) {
            return;
        }
        if transfer.status == TransferStatus::Transferring {
            return;
        }
        self.counter_seq += 1;
        self.user_counters.insert(key.user.clone(), self.counter_seq);
    }

    // ========================================================================
    // Queue position
    // ========================================================================

    /// Positions of every queued upload, consistent with [`Self::candidate`].
    ///
    /// FIFO: the number of queued files up to and including this one. For
    /// privileged users only privileged files count. Round-robin: the
    /// user's n-th file waits for n turns of every queued user.
    pub fn positions(&self, ctx: &QueueContext<'_>) -> HashMap<TransferKey, u32> {
        let mut positions = HashMap::new();
        match self.config.queue_order {
            QueueOrder::Fifo => {
                let (mut total, mut privileged) = (0u32, 0u32);
                for key in self.queue.queued() {
                    total += 1;
                    let is_privileged = ctx.users.is_privileged(&key.user);
                    if is_privileged {
                        privileged += 1;
                    }
                    positions.insert(key.clone(), if is_privileged { privileged } else { total });
                }
            }
            QueueOrder::RoundRobin => {
                let users = self.queue.queued_users().count() as u32;
                for user in self.queue.queued_users() {
                    for (index, path) in self.queue.queued_for(user).enumerate() {
                        let place = (index as u32 + 1) * users;
                        positions.insert(TransferKey::new(user, path.as_str()), place);
                    }
                }
            }
        }
        positions
    }

    pub fn place_in_queue(&self, key: &TransferKey, ctx: &QueueContext<'_>) -> u32 {
        self.positions(ctx).get(key).copied().unwrap_or(0)
    }

    /// Answers PlaceInQueueRequest. Nothing is sent unless the file is queued.
    pub fn on_place_in_queue_request(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let place = self.place_in_queue(&key, ctx);
        if place == 0 {
            return;
        }
        self.reported_positions.insert(key, place);
        out.send_peer(
            user,
            PeerMessage::PlaceInQueueResponse {
                file: virtual_path.to_string(),
                place,
            },
            TextEncoding::Utf8,
        );
    }

    /// Sends new positions to users that asked before and whose position changed.
    fn push_positions(&mut self, ctx: &QueueContext<'_>, out: &mut Outbox) {
        if self.reported_positions.is_empty() {
            return;
        }
        let positions = self.positions(ctx);
        let mut changed = Vec::new();
        self.reported_positions.retain(|key, reported| match positions.get(key) {
            Some(&place) => {
                if place != *reported {
                    *reported = place;
                    changed.push((key.clone(), place));
                }
                true
            }
            None => false,
        });
        changed.sort();
        for (key, place) in changed {
            out.send_peer(
                &key.user,
                PeerMessage::PlaceInQueueResponse {
                    file: key.virtual_path,
                    place,
                },
                TextEncoding::Utf8,
            );
        }
    }

    /// Queued files as shown to `requester` in UserInfoResponse.
    pub fn queue_size_for(&self, requester: &str, ctx: &QueueContext<'_>) -> usize {
        if ctx.users.is_privileged(requester) {
            self.queue
                .queued()
                .filter(|key| ctx.users.is_privileged(&key.user))
                .count()
        } else {
            self.queue.queued().count()
        }
    }

    pub fn has_free_slots(&self, ctx: &QueueContext<'_>) -> bool {
        self.queue.queued().next().is_none() && self.allow_new_upload(ctx)
    }

    // ========================================================================
    // Transfer negotiation
    // ========================================================================

    /// Handles the answer to our TransferRequest.
    pub fn on_transfer_response(
        &mut self,
        user: &str,
        token: u32,
        reply: &TransferReply,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let Some(key) = self.requesting(user, token) else {
            debug!(user, token, "transfer response for unknown upload");
            return;
        };
        match reply {
            TransferReply::Allowed { .. } => {
                debug!(user, token, "upload allowed, opening file connection");
                out.command(NetCommand::InitFileTransfer {
                    user: user.to_string(),
                    token,
                });
            }
            TransferReply::Denied { reason } => {
                let reason = reason.as_deref().unwrap_or("");
                info!(user, token, reason, "upload refused");
                if reason == "Complete" {
                    self.finish(&key, ctx, out);
                } else {
                    self.fail(&key, TransferStatus::Cancelled, out);
                    self.auto_clear(&key, out);
                }
                self.check_queue(ctx, out);
            }
        }
    }

    /// The downloader answered our file connection with its resume offset.
    pub fn on_upload_offset(
        &mut self,
        conn: ConnId,
        user: &str,
        token: u32,
        offset: u64,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let Some(key) = self.requesting(user, token) else {
            debug!(user, token, "file connection for unknown upload");
            out.command(NetCommand::CloseConnection(conn));
            return;
        };
        self.cancel_request_timer(&key);

        let real_path = ctx
            .shares
            .file_is_shared(user, &key.virtual_path)
            .and_then(|_| ctx.shares.virtual_to_real_path(&key.virtual_path));
        let Some(real_path) = real_path else {
            warn!(user, file = %key.virtual_path, "upload no longer shared");
            out.command(NetCommand::CloseConnection(conn));
            self.fail(&key, TransferStatus::Cancelled, out);
            self.check_queue(ctx, out);
            return;
        };

        let opened = File::open(&real_path).and_then(|file| {
            let len = file.metadata()?.len();
            Ok((file, len))
        });
        let (file, size) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(user, path = %real_path.display(), error = %e, "cannot open upload");
                out.command(NetCommand::CloseConnection(conn));
                self.fail(&key, TransferStatus::Failed(FailureReason::LocalFileError), out);
                self.check_queue(ctx, out);
                return;
            }
        };

        if size == 0 {
            out.command(NetCommand::CloseConnection(conn));
            self.queue.modify(&key, |t| t.size = 0);
            self.finish(&key, ctx, out);
            self.check_queue(ctx, out);
            return;
        }

        let now = ctx.now;
        self.queue.modify(&key, |t| {
            t.size = size;
            t.conn = Some(conn);
            t.start(offset.min(size), now);
        });
        info!(user, file = %key.virtual_path, offset, size, "upload started");
        out.command(NetCommand::AttachUpload {
            conn,
            token,
            file,
            size,
        });
        self.touch_user(&key);
        self.emit(&key, Change::Updated, out);
    }

    pub fn on_progress(
        &mut self,
        user: &str,
        token: u32,
        offset: u64,
        speed: u64,
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
            t.record_progress(offset, Some(speed), now);
            true
        });
        if updated == Some(true) {
            self.emit(&key, Change::Updated, out);
        }
    }

    /// The file connection of an upload closed.
    pub fn on_connection_closed(
        &mut self,
        user: &str,
        token: u32,
        offset: u64,
        timed_out: bool,
        ctx: &mut QueueContext<'_>,
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

        if !timed_out && offset >= size {
            let speed = self.queue.get(&key).map_or(0, |t| t.avg_speed);
            out.send_server(ServerRequest::SendUploadSpeed {
                speed: speed.min(u32::MAX as u64) as u32,
            });
            self.finish(&key, ctx, out);
        } else if timed_out {
            self.fail(&key, TransferStatus::Failed(FailureReason::ConnectionTimeout), out);
        } else if ctx.users.is_offline(user) {
            self.fail(&key, TransferStatus::Failed(FailureReason::UserLoggedOff), out);
        } else {
            self.fail(&key, TransferStatus::Cancelled, out);
            out.send_peer(
                user,
                PeerMessage::UploadFailed {
                    file: key.virtual_path.clone(),
                },
                TextEncoding::Utf8,
            );
        }
        self.check_queue(ctx, out);
    }

    /// Reading the local file failed while streaming.
    pub fn on_file_error(&mut self, user: &str, token: u32, error: &str, out: &mut Outbox) {
        let Some(key) = self.queue.key_for_token(user, token) else {
            return;
        };
        warn!(user, token, error, "upload file error");
        self.fail(&key, TransferStatus::Failed(FailureReason::LocalFileError), out);
    }

    /// No connection to `user` could be opened for the listed messages.
    pub fn on_peer_connection_error(
        &mut self,
        user: &str,
        undelivered: &[PeerMessage],
        file_token: Option<u32>,
        offline: bool,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let reason = if offline {
            FailureReason::UserLoggedOff
        } else {
            FailureReason::ConnectionTimeout
        };
        let tokens = undelivered
            .iter()
            .filter_map(|message| match message {
                PeerMessage::TransferRequest {
                    direction: TransferDirection::Upload,
                    token,
                    ..
                } => Some(*token),
                _ => None,
            })
            .chain(file_token);

        let mut failed = false;
        for token in tokens.collect::<Vec<_>>() {
            if let Some(key) = self.queue.key_for_token(user, token) {
                debug!(user, token, ?reason, "cannot reach downloader");
                self.fail(&key, TransferStatus::Failed(reason), out);
                failed = true;
            }
        }
        if failed {
            self.check_queue(ctx, out);
        }
    }

    /// Reacts to a presence change of `user`.
    pub fn on_user_status(
        &mut self,
        user: &str,
        online: bool,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        if online {
            self.check_queue(ctx, out);
            return;
        }
        let waiting: Vec<_> = self
            .queue
            .keys_for(user)
            .into_iter()
            .filter(|key| {
                self.queue.get(key).map(|t| &t.status) == Some(&TransferStatus::Requesting)
            })
            .collect();
        for key in waiting {
            self.fail(&key, TransferStatus::Failed(FailureReason::UserLoggedOff), out);
        }
        self.check_queue(ctx, out);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Fires due timers.
    pub fn poll(&mut self, ctx: &mut QueueContext<'_>, out: &mut Outbox) {
        let now = ctx.now;
        for timer in self.timers.expired(now) {
            match timer {
                UploadTimer::RequestTimeout(key, token) => {
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
                            "upload request timed out"
                        );
                        let status = TransferStatus::Failed(FailureReason::ConnectionTimeout);
                        self.fail(&key, status, out);
                    }
                }
                UploadTimer::CheckQueue => {
                    self.timers
                        .schedule(now + UPLOAD_QUEUE_CHECK_INTERVAL, UploadTimer::CheckQueue);
                }
                UploadTimer::RetryFailed => {
                    self.timers.schedule(now + RETRY_FAILED_INTERVAL, UploadTimer::RetryFailed);
                    self.retry_where(|reason| reason.is_connection_failure(), out);
                }
                UploadTimer::RetryLocalErrors => {
                    self.timers
                        .schedule(now + RETRY_LIMITED_INTERVAL, UploadTimer::RetryLocalErrors);
                    self.retry_where(|reason| reason == FailureReason::LocalFileError, out);
                }
            }
        }
        self.check_queue(ctx, out);
    }

    fn retry_where(&mut self, matches: impl Fn(FailureReason) -> bool, out: &mut Outbox) {
        for key in self.queue.failed_keys() {
            let retry = self
                .queue
                .get(&key)
                .and_then(|t| t.status.failure())
                .is_some_and(&matches);
            if retry {
                self.queue.modify(&key, |t| {
                    t.status = TransferStatus::Queued;
                    t.retry_attempt += 1;
                    t.detach();
                });
                self.emit(&key, Change::Updated, out);
            }
        }
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Stops an upload. A queued file is reported to the user as cancelled.
    pub fn abort(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let Some(status) = self.queue.get(&key).map(|t| t.status.clone()) else {
            return;
        };
        if status == TransferStatus::Finished {
            return;
        }
        if status == TransferStatus::Queued {
            out.send_peer(
                user,
                PeerMessage::UploadDenied {
                    file: virtual_path.to_string(),
                    reason: "Cancelled".to_string(),
                },
                TextEncoding::Utf8,
            );
        }
        self.fail(&key, TransferStatus::Cancelled, out);
        self.check_queue(ctx, out);
    }

    /// Queues a stopped upload again.
    pub fn retry(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        let size = match self.queue.get(&key) {
            Some(t)
                if !t.status.is_active()
                    && t.status != TransferStatus::Queued
                    && t.status != TransferStatus::Finished =>
            {
                t.size
            }
            _ => return,
        };
        self.enqueue(&key, size, out);
        self.check_queue(ctx, out);
    }

    /// Removes a record, aborting it first if needed.
    pub fn clear(
        &mut self,
        user: &str,
        virtual_path: &str,
        ctx: &mut QueueContext<'_>,
        out: &mut Outbox,
    ) {
        let key = TransferKey::new(user, virtual_path);
        if self.queue.is_pending(&key) {
            self.abort(user, virtual_path, ctx, out);
        }
        self.remove(&key, out);
    }

    /// Removes every finished upload.
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
    // State changes
    // ========================================================================

    fn requesting(&self, user: &str, token: u32) -> Option<TransferKey> {
        let key = self.queue.key_for_token(user, token)?;
        (self.queue.get(&key)?.status == TransferStatus::Requesting).then_some(key)
    }

    fn finish(&mut self, key: &TransferKey, ctx: &QueueContext<'_>, out: &mut Outbox) {
        self.cancel_request_timer(key);
        let now = ctx.now;
        self.queue.modify(key, |t| t.finish(now));
        info!(user = %key.user, file = %key.virtual_path, "upload finished");
        self.touch_user(key);
        self.emit(key, Change::Finished, out);
        self.auto_clear(key, out);
    }

    fn fail(&mut self, key: &TransferKey, status: TransferStatus, out: &mut Outbox) {
        self.cancel_request_timer(key);
        let Some(conn) = self.queue.modify(key, |t| {
            let conn = t.conn;
            t.status = status;
            t.detach();
            conn
        }) else {
            return;
        };
        if let Some(conn) = conn {
            out.command(NetCommand::CloseConnection(conn));
        }
        self.reported_positions.remove(key);
        self.touch_user(key);
        self.emit(key, Change::Aborted, out);
    }

    fn auto_clear(&mut self, key: &TransferKey, out: &mut Outbox) {
        if self.config.autoclear_uploads {
            self.remove(key, out);
        }
    }

    fn remove(&mut self, key: &TransferKey, out: &mut Outbox) {
        self.cancel_request_timer(key);
        self.reported_positions.remove(key);
        if let Some(transfer) = self.queue.remove(key) {
            out.event(Change::Cleared.event(TransferKind::Upload, transfer));
        }
    }

    fn cancel_request_timer(&mut self, key: &TransferKey) {
        if let Some(id) = self.request_timers.remove(key) {
            self.timers.cancel(id);
        }
    }

    fn emit(&self, key: &TransferKey, change: Change, out: &mut Outbox) {
        if let Some(transfer) = self.queue.get(key) {
            out.event(change.event(TransferKind::Upload, transfer.clone()));
        }
    }
}
