//! Event deduplication cache
//!
//! Messenger redelivers webhooks it considers unacknowledged, so the same
//! message can arrive several times within a few minutes.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Default dedup TTL (5 minutes)
const DEDUP_TTL_SECS: u64 = 300;

/// Maximum dedup cache entries
const DEDUP_MAX_ENTRIES: usize = 10_000;

/// Fingerprint deduplication cache
///
/// TTL-based eviction with a hard cap on entries. The check-and-record step
/// is atomic per key, so two concurrent deliveries of one event cannot both
/// pass.
#[derive(Debug)]
pub struct EventDedup {
    cache: DashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for EventDedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEDUP_TTL_SECS), DEDUP_MAX_ENTRIES)
    }
}

impl EventDedup {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Check if the given key has been seen recently.
    ///
    /// Returns `true` if this is a duplicate (already seen within TTL).
    /// Returns `false` on first sight and records the key.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let now = Instant::now();

        if self.cache.len() >= self.max_entries {
            self.evict(now);
        }

        match self.cache.entry(key.to_string()) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) < self.ttl {
                    true
                } else {
                    seen.insert(now);
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    /// Record a key without checking it (used for replayed events)
    pub fn remember(&self, key: &str) {
        self.cache.insert(key.to_string(), Instant::now());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn evict(&self, now: Instant) {
        self.cache.retain(|_, ts| now.duration_since(*ts) < self.ttl);

        // Still full: drop the oldest entry
        if self.cache.len() >= self.max_entries {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| *e.value())
                .map(|e| e.key().clone());
            if let Some(key) = oldest {
                self.cache.remove(&key);
            }
        }
    }
}
