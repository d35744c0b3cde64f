use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::status::TransferStatus;
use crate::constants::RATE_SMOOTHING;
use crate::net::ConnId;

/// Unique identity of a transfer within one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub user: String,
    pub virtual_path: String,
}

impl TransferKey {
    pub fn new(user: impl Into<String>, virtual_path: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            virtual_path: virtual_path.into(),
        }
    }
}

/// One download or upload.
///
/// Only the identifying fields, the size, the offset and the status are
/// persisted. Everything else describes the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub user: String,
    pub virtual_path: String,
    /// Destination folder of a download.
    #[serde(default)]
    pub folder_path: Option<PathBuf>,
    pub size: u64,
    #[serde(default)]
    pub current_byte_offset: u64,
    pub status: TransferStatus,

    #[serde(skip)]
    pub token: Option<u32>,
    #[serde(skip)]
    pub queue_position: u32,
    /// Automatic retries since the last explicit request.
    #[serde(skip)]
    pub retry_attempt: u32,
    /// The path was sent Latin-1 encoded for an old client.
    #[serde(skip)]
    pub legacy_attempt: bool,
    /// Queued again locally after the peer hit a queue limit.
    #[serde(skip)]
    pub limited: bool,
    /// The peer announced a size different from the one we queued.
    #[serde(skip)]
    pub size_changed: bool,
    /// File connection carrying the data.
    #[serde(skip)]
    pub conn: Option<ConnId>,
    /// Bytes per second.
    #[serde(skip)]
    pub speed: u64,
    /// Bytes per second since the transfer started.
    #[serde(skip)]
    pub avg_speed: u64,
    #[serde(skip)]
    pub time_elapsed: Duration,
    #[serde(skip)]
    pub time_left: Option<Duration>,

    #[serde(skip)]
    started: Option<Instant>,
    #[serde(skip)]
    start_offset: u64,
    #[serde(skip)]
    last_update: Option<Instant>,
}

impl Transfer {
    pub fn new(user: impl Into<String>, virtual_path: impl Into<String>, size: u64) -> Self {
        Self {
            user: user.into(),
            virtual_path: virtual_path.into(),
            folder_path: None,
            size,
            current_byte_offset: 0,
            status: TransferStatus::Queued,
            token: None,
            queue_position: 0,
            retry_attempt: 0,
            legacy_attempt: false,
            limited: false,
            size_changed: false,
            conn: None,
            speed: 0,
            avg_speed: 0,
            time_elapsed: Duration::ZERO,
            time_left: None,
            started: None,
            start_offset: 0,
            last_update: None,
        }
    }

    pub fn key(&self) -> TransferKey {
        TransferKey::new(&self.user, &self.virtual_path)
    }

    /// Last component of the virtual path. Both separators are accepted.
    pub fn basename(&self) -> &str {
        self.virtual_path
            .rsplit(|c: char| c == '\\' || c == '/')
            .next()
            .unwrap_or(&self.virtual_path)
    }

    /// Marks the start of data transfer at `offset`.
    pub fn start(&mut self, offset: u64, now: Instant) {
        self.status = TransferStatus::Transferring;
        self.current_byte_offset = offset;
        self.start_offset = offset;
        self.started = Some(now);
        self.last_update = Some(now);
        self.queue_position = 0;
        self.speed = 0;
        self.avg_speed = 0;
        self.time_left = None;
    }

    /// Records a new offset. Offsets never move backwards.
    ///
    /// `reported_speed` is used as is when the caller measured it, otherwise
    /// the speed is derived from the offset delta.
    pub fn record_progress(&mut self, offset: u64, reported_speed: Option<u64>, now: Instant) {
        let offset = offset.min(self.size);
        if offset < self.current_byte_offset {
            return;
        }
        let delta = offset - self.current_byte_offset;
        let since_last = self
            .last_update
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);

        self.speed = match reported_speed {
            Some(speed) => speed,
            None if since_last > 0.0 => {
                let sample = delta as f64 / since_last;
                if self.speed == 0 {
                    sample as u64
                } else {
                    (RATE_SMOOTHING * sample + (1.0 - RATE_SMOOTHING) * self.speed as f64) as u64
                }
            }
            None => self.speed,
        };

        self.current_byte_offset = offset;
        self.last_update = Some(now);
        if let Some(started) = self.started {
            self.time_elapsed = now.saturating_duration_since(started);
            let secs = self.time_elapsed.as_secs_f64();
            if secs > 0.0 {
                self.avg_speed = ((offset - self.start_offset) as f64 / secs) as u64;
            }
        }

        let left = self.size - offset;
        self.time_left = if left == 0 {
            Some(Duration::ZERO)
        } else if self.speed > 0 {
            Some(Duration::from_secs(left / self.speed))
        } else {
            None
        };
    }

    /// Sets the finished state. The offset always equals the size afterwards.
    pub fn finish(&mut self, now: Instant) {
        self.record_progress(self.size, None, now);
        self.status = TransferStatus::Finished;
        self.current_byte_offset = self.size;
        self.time_left = Some(Duration::ZERO);
        self.token = None;
        self.conn = None;
        self.limited = false;
        self.queue_position = 0;
    }

    /// Clears the per-session state before a transfer leaves the active set.
    pub fn detach(&mut self) {
        self.token = None;
        self.conn = None;
        self.queue_position = 0;
        self.speed = 0;
        self.time_left = None;
        self.started = None;
        self.last_update = None;
    }
}
