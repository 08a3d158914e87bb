//! Sliding-window request limiter keyed by opaque client identifiers.

pub mod store;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

pub use store::{Clock, MemoryWindowStore, SystemClock, WindowStore};

const KEY_PREFIX: &str = "rate_limit:";

/// At most `max_requests` per identifier in any rolling `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 300,
        }
    }
}

/// Per-identifier sliding window over a shared [`WindowStore`].
///
/// Stale timestamps are filtered on every read, so an identifier with nothing
/// left in its window is back to a full allowance without any cleanup pass.
/// Identifiers never reach the store in the clear: keys are SHA-256 digests.
#[derive(Debug, Default)]
pub struct RateLimiter<S = MemoryWindowStore, C = SystemClock> {
    store: S,
    clock: C,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: WindowStore, C: Clock> RateLimiter<S, C> {
    pub fn with_parts(store: S, clock: C, policy: RateLimitPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub fn is_rate_limited(&self, id: &str) -> bool {
        let limited = self.live_count(id) >= self.policy.max_requests as usize;
        if limited {
            debug!(key = %store_key(id), "rate limit exceeded");
        }
        limited
    }

    /// Append the current time to the identifier's window and push its
    /// expiry out to one full window from now.
    pub fn record_request(&self, id: &str) {
        let now = self.clock.now();
        let window = self.policy.window();
        self.store.update(&store_key(id), now, window, |stamps| {
            stamps.retain(|t| is_live(*t, now, window));
            stamps.push(now);
        });
    }

    /// Check and record in one step: returns `true` and records the request
    /// when the identifier is under its limit, `false` otherwise.
    pub fn acquire(&self, id: &str) -> bool {
        let now = self.clock.now();
        let window = self.policy.window();
        let max = self.policy.max_requests as usize;
        let allowed = self.store.update(&store_key(id), now, window, |stamps| {
            stamps.retain(|t| is_live(*t, now, window));
            if stamps.len() < max {
                stamps.push(now);
                true
            } else {
                false
            }
        });
        if !allowed {
            debug!(key = %store_key(id), "rate limit exceeded");
        }
        allowed
    }

    pub fn remaining_requests(&self, id: &str) -> u32 {
        let used = u32::try_from(self.live_count(id)).unwrap_or(u32::MAX);
        self.policy.max_requests.saturating_sub(used)
    }

    /// Whole seconds until the oldest live request leaves the window, rounded
    /// up. Zero when the identifier has no live requests.
    pub fn time_until_reset(&self, id: &str) -> u64 {
        let now = self.clock.now();
        let window = self.policy.window();
        let Some(oldest) = self.live_stamps(id, now).into_iter().min() else {
            return 0;
        };
        let left = window.saturating_sub(now.saturating_duration_since(oldest));
        left.as_secs() + u64::from(left.subsec_nanos() > 0)
    }

    pub fn reset(&self, id: &str) {
        self.store.delete(&store_key(id));
    }

    fn live_count(&self, id: &str) -> usize {
        self.live_stamps(id, self.clock.now()).len()
    }

    fn live_stamps(&self, id: &str, now: Instant) -> Vec<Instant> {
        let window = self.policy.window();
        let mut stamps = self.store.get(&store_key(id), now).unwrap_or_default();
        stamps.retain(|t| is_live(*t, now, window));
        stamps
    }
}

fn is_live(stamp: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(stamp) < window
}

fn store_key(id: &str) -> String {
    format!("{KEY_PREFIX}{:x}", Sha256::digest(id.as_bytes()))
}
