//! Monitoring registration: a TTL'd set of user ids.
//!
//! Membership is advisory — it only gates live fan-out, never archival.
//! `is_monitored` sits on the event-emission hot path and stays O(1).

use std::time::{Duration, Instant};

pub struct MonitorSet {
    entries: dashmap::DashMap<i64, Instant>,
}

impl Default for MonitorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorSet {
    pub fn new() -> Self {
        Self {
            entries: dashmap::DashMap::new(),
        }
    }

    /// Enable monitoring for a user. Returns the expiry instant.
    pub fn enable(&self, user_id: i64, ttl: Duration) -> Instant {
        let expiry = Instant::now() + ttl;
        self.entries.insert(user_id, expiry);
        expiry
    }

    pub fn disable(&self, user_id: i64) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Hot-path membership check; expired entries are removed lazily.
    pub fn is_monitored(&self, user_id: i64) -> bool {
        // Copy the expiry out before mutating — holding a map ref across
        // remove() on the same shard would deadlock.
        let expiry = match self.entries.get(&user_id) {
            Some(e) => *e,
            None => return false,
        };
        if Instant::now() < expiry {
            true
        } else {
            self.entries.remove(&user_id);
            false
        }
    }

    /// Active registrations with seconds remaining.
    pub fn list(&self) -> Vec<(i64, u64)> {
        let now = Instant::now();
        let mut out: Vec<(i64, u64)> = self
            .entries
            .iter()
            .filter(|e| now < *e.value())
            .map(|e| (*e.key(), e.value().duration_since(now).as_secs()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| now < *expiry);
    }
}
