//! Bandwidth shaping using token buckets.
//!
//! Unlike a blocking limiter, the engine never sleeps on bandwidth: on every
//! pass it asks how many bytes each connection may move and writes or reads
//! at most that much. Buckets refill from the `Instant` the caller passes in,
//! which keeps the arithmetic deterministic under test.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use rslsk::net::{ShapingPolicy, UploadShaper};
//!
//! let start = Instant::now();
//! let mut shaper = UploadShaper::new(100_000, ShapingPolicy::TotalBandwidth, start);
//! let conn = rslsk::net::ConnId::from_raw(1);
//! shaper.register(conn, start);
//!
//! shaper.begin_pass(start);
//! let budget = shaper.budget(conn, start);
//! assert!(budget <= 200_000);
//! shaper.consume(conn, budget, start);
//!
//! // Nothing left until the bucket refills
//! assert_eq!(shaper.budget(conn, start), 0);
//! let later = start + Duration::from_millis(100);
//! shaper.begin_pass(later);
//! assert!(shaper.budget(conn, later) > 0);
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::connection::ConnId;
use crate::constants::{MIN_UPLOAD_RATE, MIN_UPLOAD_READ_AHEAD, RATE_SMOOTHING};

/// How an upload limit is shared between concurrent uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapingPolicy {
    /// Each upload gets `limit / active`, with a floor of 1 KiB/s.
    #[default]
    SplitEvenly,
    /// All uploads drain one shared bucket, each pass offering a fair share.
    TotalBandwidth,
}

/// A token bucket refilled at a fixed rate.
///
/// The bucket holds up to twice the rate to allow for bursts.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64, now: Instant) -> Self {
        let max_tokens = bytes_per_sec.saturating_mul(2) as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            tokens_per_sec: bytes_per_sec as f64,
            last_update: now,
        }
    }

    fn set_rate(&mut self, bytes_per_sec: u64) {
        self.tokens_per_sec = bytes_per_sec as f64;
        self.max_tokens = bytes_per_sec.saturating_mul(2) as f64;
        self.tokens = self.tokens.min(self.max_tokens);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }

    fn available(&mut self, now: Instant) -> usize {
        self.refill(now);
        self.tokens as usize
    }

    fn consume(&mut self, bytes: usize) {
        self.tokens = (self.tokens - bytes as f64).max(0.0);
    }
}

/// Rolling transfer rate, sampled once per second.
#[derive(Debug, Clone)]
pub struct RateMeter {
    rate: f64,
    window_bytes: u64,
    window_start: Instant,
}

impl RateMeter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        Self {
            rate: 0.0,
            window_bytes: 0,
            window_start: now,
        }
    }

    pub fn record(&mut self, bytes: usize, now: Instant) {
        self.window_bytes += bytes as u64;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Self::WINDOW {
            let sample = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.rate = if self.rate == 0.0 {
                sample
            } else {
                RATE_SMOOTHING * sample + (1.0 - RATE_SMOOTHING) * self.rate
            };
            self.window_bytes = 0;
            self.window_start = now;
        }
    }

    /// Bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate as u64
    }
}

/// Caps how many bytes each upload connection may send per engine pass.
#[derive(Debug)]
pub struct UploadShaper {
    limit: u64,
    policy: ShapingPolicy,
    global: TokenBucket,
    per_conn: HashMap<ConnId, TokenBucket>,
    meters: HashMap<ConnId, RateMeter>,
    fair_share: usize,
}

impl UploadShaper {
    /// Creates a shaper. A limit of 0 means unlimited.
    pub fn new(limit: u64, policy: ShapingPolicy, now: Instant) -> Self {
        Self {
            limit,
            policy,
            global: TokenBucket::new(limit, now),
            per_conn: HashMap::new(),
            meters: HashMap::new(),
            fair_share: 0,
        }
    }

    pub fn unlimited(now: Instant) -> Self {
        Self::new(0, ShapingPolicy::default(), now)
    }

    pub fn set_limit(&mut self, limit: u64, policy: ShapingPolicy, now: Instant) {
        self.limit = limit;
        self.policy = policy;
        self.global = TokenBucket::new(limit, now);
        let rate = self.per_connection_rate();
        for bucket in self.per_conn.values_mut() {
            *bucket = TokenBucket::new(rate, now);
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn policy(&self) -> ShapingPolicy {
        self.policy
    }

    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }

    pub fn register(&mut self, conn: ConnId, now: Instant) {
        self.meters.insert(conn, RateMeter::new(now));
        let rate = self.per_connection_rate_with(self.meters.len());
        self.per_conn.insert(conn, TokenBucket::new(rate, now));
    }

    pub fn unregister(&mut self, conn: ConnId) {
        self.meters.remove(&conn);
        self.per_conn.remove(&conn);
    }

    pub fn active(&self) -> usize {
        self.meters.len()
    }

    fn per_connection_rate(&self) -> u64 {
        self.per_connection_rate_with(self.meters.len())
    }

    fn per_connection_rate_with(&self, active: usize) -> u64 {
        (self.limit / active.max(1) as u64).max(MIN_UPLOAD_RATE)
    }

    /// Refreshes the per-pass allowances. Called once per engine iteration.
    pub fn begin_pass(&mut self, now: Instant) {
        if !self.is_limited() {
            return;
        }
        match self.policy {
            ShapingPolicy::SplitEvenly => {
                let rate = self.per_connection_rate();
                for bucket in self.per_conn.values_mut() {
                    bucket.set_rate(rate);
                }
            }
            ShapingPolicy::TotalBandwidth => {
                let available = self.global.available(now);
                self.fair_share = (available / self.active().max(1)).max(1);
            }
        }
    }

    /// Bytes `conn` may send right now.
    pub fn budget(&mut self, conn: ConnId, now: Instant) -> usize {
        if !self.is_limited() {
            return usize::MAX;
        }
        match self.policy {
            ShapingPolicy::SplitEvenly => self
                .per_conn
                .get_mut(&conn)
                .map_or(0, |bucket| bucket.available(now)),
            ShapingPolicy::TotalBandwidth => self.global.available(now).min(self.fair_share),
        }
    }

    /// Records bytes actually sent by `conn`.
    pub fn consume(&mut self, conn: ConnId, bytes: usize, now: Instant) {
        if let Some(meter) = self.meters.get_mut(&conn) {
            meter.record(bytes, now);
        }
        if !self.is_limited() {
            return;
        }
        match self.policy {
            ShapingPolicy::SplitEvenly => {
                if let Some(bucket) = self.per_conn.get_mut(&conn) {
                    bucket.consume(bytes);
                }
            }
            ShapingPolicy::TotalBandwidth => {
                self.global.consume(bytes);
            }
        }
    }

    /// Current send rate of `conn` in bytes per second.
    pub fn rate(&self, conn: ConnId) -> u64 {
        self.meters.get(&conn).map_or(0, RateMeter::rate)
    }

    /// How much file data to buffer ahead of the socket: a little more than
    /// one second at the current rate, never more than the budget.
    pub fn read_ahead(&self, conn: ConnId, budget: usize) -> usize {
        let wanted = (self.rate(conn) as f64 * 1.2) as usize;
        wanted.max(MIN_UPLOAD_READ_AHEAD).min(budget)
    }
}

/// Optional token bucket applied to download reads.
#[derive(Debug)]
pub struct DownloadLimiter {
    bucket: Option<TokenBucket>,
}

impl DownloadLimiter {
    /// A limit of 0 means unlimited.
    pub fn new(limit: u64, now: Instant) -> Self {
        Self {
            bucket: (limit > 0).then(|| TokenBucket::new(limit, now)),
        }
    }

    pub fn set_limit(&mut self, limit: u64, now: Instant) {
        *self = Self::new(limit, now);
    }

    pub fn budget(&mut self, now: Instant) -> usize {
        self.bucket
            .as_mut()
            .map_or(usize::MAX, |bucket| bucket.available(now))
    }

    pub fn consume(&mut self, bytes: usize) {
        if let Some(bucket) = self.bucket.as_mut() {
            bucket.consume(bytes);
        }
    }
}
