//! Ports for the rate limiter's shared state, plus in-process adapters.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Port for obtaining the current time. Tests substitute a controllable clock.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// System clock using `Instant::now()`. Monotonic, so wall-clock adjustments
/// never reorder a window's timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Port for the key/value store holding request timestamps per key.
///
/// Entries carry their own time-to-live as a backstop; the limiter still
/// filters stale timestamps itself on every read.
pub trait WindowStore: Send + Sync + Debug {
    /// Get-or-set with TTL: run `f` on the timestamps under `key`, starting
    /// from an empty window when the key is absent or its TTL has lapsed, then
    /// push the key's expiry out to `now + ttl`. Calls for the same key are
    /// serialized, so read-modify-write inside `f` never loses an update.
    fn update<F, R>(&self, key: &str, now: Instant, ttl: Duration, f: F) -> R
    where
        F: FnOnce(&mut Vec<Instant>) -> R;

    /// Snapshot of the timestamps under `key`, or `None` if absent or expired.
    fn get(&self, key: &str, now: Instant) -> Option<Vec<Instant>>;

    fn delete(&self, key: &str);
}

#[derive(Debug)]
struct WindowEntry {
    stamps: Vec<Instant>,
    expires_at: Instant,
}

/// Writes between sweeps of expired entries.
const PURGE_INTERVAL: u64 = 256;

/// Single-node store backed by DashMap; the per-shard write lock held by an
/// entry guard serializes updates to the same key.
///
/// Expired entries are dropped when `get` finds them and by a sweep every
/// [`PURGE_INTERVAL`] writes, so idle identifiers do not accumulate.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    map: DashMap<String, WindowEntry>,
    writes: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry whose TTL has lapsed. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.map.len())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl WindowStore for MemoryWindowStore {
    fn update<F, R>(&self, key: &str, now: Instant, ttl: Duration, f: F) -> R
    where
        F: FnOnce(&mut Vec<Instant>) -> R,
    {
        // sweep before taking the entry guard: retain locks every shard
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_INTERVAL == 0 {
            self.purge_expired(now);
        }

        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                stamps: Vec::new(),
                expires_at: now + ttl,
            });
        if entry.expires_at <= now {
            entry.stamps.clear();
        }
        entry.expires_at = now + ttl;
        f(&mut entry.stamps)
    }

    fn get(&self, key: &str, now: Instant) -> Option<Vec<Instant>> {
        match self.map.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.stamps.clone()),
            Some(_) => {}
            None => return None,
        }
        // re-checked under the write lock; a concurrent update may have revived it
        self.map.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    fn delete(&self, key: &str) {
        self.map.remove(key);
    }
}
