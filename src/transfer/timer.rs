//! Deadline-ordered timers owned by the network thread.

use std::collections::BTreeMap;
use std::time::Instant;

/// Handle returned by [`TimerWheel::schedule`], used to cancel a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(Instant, u64);

impl TimerId {
    pub fn deadline(&self) -> Instant {
        self.0
    }
}

/// Timers sorted by deadline. Timers with equal deadlines fire in the
/// order they were scheduled.
#[derive(Debug)]
pub struct TimerWheel<K> {
    timers: BTreeMap<TimerId, K>,
    seq: u64,
}

impl<K> Default for TimerWheel<K> {
    fn default() -> Self {
        Self {
            timers: BTreeMap::new(),
            seq: 0,
        }
    }
}

impl<K> TimerWheel<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, key: K) -> TimerId {
        self.seq += 1;
        let id = TimerId(at, self.seq);
        self.timers.insert(id, key);
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<K> {
        self.timers.remove(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(TimerId::deadline)
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            fired.push(entry.remove());
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}
