//! Windowed counter storage.
//!
//! The [`CounterStore`] trait is the seam between the limiter and where
//! counters live. [`MemoryStore`] is the in-process implementation, backed by
//! a sharded concurrent map so that increments on unrelated keys never
//! contend and a sweep only ever holds one shard at a time.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::{add_saturating, Clock, SystemClock};
use super::key::RateLimitKey;

/// Counter state for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    /// Requests counted in the current window (at least 1 once created)
    pub count: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    /// Open a fresh window at `now`.
    pub fn start(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: add_saturating(now, window),
        }
    }

    /// Whether the window has ended as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries removed because their window had ended
    pub expired: usize,
    /// Entries removed because they violated the entry invariants
    pub invalid: usize,
    /// Entries left in the store
    pub retained: usize,
}

impl SweepStats {
    /// Total entries removed.
    pub fn removed(&self) -> usize {
        self.expired + self.invalid
    }
}

/// Storage for windowed counters.
///
/// Every operation must be synchronized internally: concurrent increments on
/// the same key may never lose an update.
pub trait CounterStore: Send + Sync {
    /// Count one request for `key`, opening a new window of `window` if the
    /// key has no entry or its window has ended. Returns the updated entry.
    fn increment(&self, key: &RateLimitKey, window: Duration) -> CounterEntry;

    /// Read the entry for `key` without counting.
    fn get(&self, key: &RateLimitKey) -> Option<CounterEntry>;

    /// Forget `key`, so its next request opens a fresh window.
    fn reset(&self, key: &RateLimitKey);

    /// Remove every entry whose window has ended.
    fn sweep(&self) -> SweepStats;

    /// Remove every entry.
    fn clear(&self);

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Whether the store holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process counter store.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<RateLimitKey, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// The clock this store measures windows with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryStore {
    fn increment(&self, key: &RateLimitKey, window: Duration) -> CounterEntry {
        let now = self.clock.now();

        // The entry guard holds the shard's write lock, so the
        // read-modify-write below is atomic for this key.
        let entry = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_expired(now) {
                    *current = CounterEntry::start(now, window);
                    debug!(key = %key, reset_at = %current.reset_at, "Window expired, starting new window");
                } else {
                    current.count = current.count.saturating_add(1);
                }
                *current
            }
            Entry::Vacant(vacant) => {
                let fresh = CounterEntry::start(now, window);
                debug!(key = %key, reset_at = %fresh.reset_at, "Creating new rate limit counter");
                *vacant.insert(fresh)
            }
        };

        trace!(key = %key, count = entry.count, "Incremented counter");
        entry
    }

    fn get(&self, key: &RateLimitKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    fn reset(&self, key: &RateLimitKey) {
        if self.entries.remove(key).is_some() {
            debug!(key = %key, "Counter reset");
        }
    }

    fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        // retain() write-locks one shard at a time.
        self.entries.retain(|key, entry| {
            if entry.count == 0 {
                warn!(key = %key, "Dropping counter with zero count");
                stats.invalid += 1;
                return false;
            }
            if entry.is_expired(now) {
                stats.expired += 1;
                return false;
            }
            stats.retained += 1;
            true
        });

        stats
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use chrono::TimeDelta;
    use std::thread;

    const WINDOW: Duration = Duration::from_secs(60);

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    fn key(value: &str) -> RateLimitKey {
        RateLimitKey::user("test", value)
    }

    #[test]
    fn test_first_increment_creates_entry() {
        let (store, clock) = store_with_clock();

        let entry = store.increment(&key("a"), WINDOW);

        assert_eq!(entry.count, 1);
        assert_eq!(entry.reset_at, clock.now() + TimeDelta::seconds(60));
        assert_eq!(store.get(&key("a")), Some(entry));
    }

    #[test]
    fn test_increments_accumulate_within_window() {
        let (store, clock) = store_with_clock();
        let first = store.increment(&key("a"), WINDOW);

        clock.advance(Duration::from_secs(10));
        for _ in 0..9 {
            store.increment(&key("a"), WINDOW);
        }

        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.count, 10);
        // The window end is fixed at creation.
        assert_eq!(entry.reset_at, first.reset_at);
    }

    #[test]
    fn test_increment_after_expiry_starts_new_window() {
        let (store, clock) = store_with_clock();
        for _ in 0..3 {
            store.increment(&key("a"), WINDOW);
        }

        clock.advance(WINDOW);
        let entry = store.increment(&key("a"), WINDOW);

        assert_eq!(entry.count, 1);
        assert_eq!(entry.reset_at, clock.now() + TimeDelta::seconds(60));
    }

    #[test]
    fn test_keys_are_independent() {
        let (store, _clock) = store_with_clock();

        store.increment(&key("a"), WINDOW);
        store.increment(&key("a"), WINDOW);
        store.increment(&RateLimitKey::user("other", "a"), WINDOW);

        assert_eq!(store.get(&key("a")).unwrap().count, 2);
        assert_eq!(store.get(&RateLimitKey::user("other", "a")).unwrap().count, 1);
        assert!(store.get(&key("b")).is_none());
    }

    #[test]
    fn test_get_does_not_mutate() {
        let (store, clock) = store_with_clock();
        store.increment(&key("a"), WINDOW);
        clock.advance(Duration::from_secs(120));

        // Expired but unswept entries are still visible.
        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reset_grants_fresh_window() {
        let (store, _clock) = store_with_clock();
        for _ in 0..5 {
            store.increment(&key("a"), WINDOW);
        }

        store.reset(&key("a"));
        assert!(store.get(&key("a")).is_none());

        assert_eq!(store.increment(&key("a"), WINDOW).count, 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (store, clock) = store_with_clock();
        store.increment(&key("short"), Duration::from_secs(10));
        store.increment(&key("boundary"), Duration::from_secs(30));
        store.increment(&key("long"), Duration::from_secs(300));

        clock.advance(Duration::from_secs(30));
        let stats = store.sweep();

        assert_eq!(stats.expired, 2);
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.removed(), 2);
        assert!(store.get(&key("short")).is_none());
        assert!(store.get(&key("boundary")).is_none());
        assert_eq!(store.get(&key("long")).unwrap().count, 1);
    }

    #[test]
    fn test_sweep_drops_invalid_entries() {
        let (store, clock) = store_with_clock();
        store.entries.insert(
            key("broken"),
            CounterEntry {
                count: 0,
                reset_at: clock.now() + TimeDelta::seconds(60),
            },
        );
        store.increment(&key("ok"), WINDOW);

        let stats = store.sweep();

        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.retained, 1);
        assert!(store.get(&key("ok")).is_some());
    }

    #[test]
    fn test_clear() {
        let (store, _clock) = store_with_clock();
        store.increment(&key("a"), WINDOW);
        store.increment(&key("b"), WINDOW);
        assert_eq!(store.len(), 2);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_increments_lose_no_updates() {
        let store = Arc::new(MemoryStore::new());
        let threads = 8;
        let per_thread = 1_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        store.increment(&key("hot"), Duration::from_secs(3600));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            store.get(&key("hot")).unwrap().count,
            (threads * per_thread) as u64
        );
    }
}
