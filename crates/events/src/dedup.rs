//! Bounded recently-seen set of event identifiers
//!
//! The platform redelivers events it considers unacknowledged, so the same
//! event id can arrive more than once. `insert` is the only mutation:
//! insert-if-absent with a TTL, plus oldest-first eviction when the set is
//! full.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default window in which a redelivery is treated as a duplicate.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Default cap on remembered event ids.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    // Insertion order for eviction; stale entries are skipped on pop.
    order: VecDeque<String>,
}

impl DedupCache {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            seen: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Record an event id. Returns `true` if the id is new (process it),
    /// `false` if it was already seen within the TTL (duplicate delivery).
    pub fn insert(&mut self, event_id: &str) -> bool {
        let now = Instant::now();
        self.evict_expired(now);

        if let Some(seen_at) = self.seen.get(event_id) {
            if now.duration_since(*seen_at) < self.ttl {
                debug!(event_id, "duplicate event within dedup ttl");
                return false;
            }
        }

        if self.seen.len() >= self.capacity {
            self.evict_oldest();
        }

        self.seen.insert(event_id.to_string(), now);
        self.order.push_back(event_id.to_string());
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .is_none_or(|at| now.duration_since(*at) >= self.ttl);
            if !expired {
                break;
            }
            let id = self.order.pop_front().unwrap_or_default();
            self.seen.remove(&id);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(id) = self.order.pop_front() {
            self.seen.remove(&id);
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delivery_accepted_duplicate_rejected() {
        let mut cache = DedupCache::default();
        assert!(cache.insert("evt_1"));
        assert!(!cache.insert("evt_1"));
        assert!(cache.insert("evt_2"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_expired_entry_accepted_again() {
        let mut cache = DedupCache::new(Duration::from_millis(0), 16);
        assert!(cache.insert("evt_1"));
        // Zero TTL: the entry is already stale on the next insert.
        assert!(cache.insert("evt_1"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 2);
        assert!(cache.insert("evt_1"));
        assert!(cache.insert("evt_2"));
        assert!(cache.insert("evt_3"));
        assert_eq!(cache.len(), 2);
        // evt_1 was evicted, so it reads as new again.
        assert!(cache.insert("evt_1"));
    }
}
