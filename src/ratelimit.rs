//! Per-source-address fixed-window rate limiter.
//!
//! A 60-second fixed window per key bounds the number of connections
//! admitted from any one source to at most `limit` per window: simpler,
//! and looser, than a token bucket.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

struct Entry {
    count: u32,
    window_end: Instant,
}

/// Shared, internally-synchronized rate limiter keyed by source address.
///
/// `check` is linearizable per key: `DashMap`'s per-shard locking is
/// sufficient at the expected connection rate of this proxy.
pub struct RateLimiter {
    limit: u32,
    buckets: DashMap<String, Entry>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: DashMap::new(),
        }
    }

    /// Returns true if a connection from `key` is admitted under the current
    /// window, incrementing its count as a side effect.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();

        match self.buckets.get_mut(key) {
            Some(mut entry) if now <= entry.window_end => {
                if entry.count >= self.limit {
                    false
                } else {
                    entry.count += 1;
                    true
                }
            }
            _ => {
                self.buckets.insert(
                    key.to_string(),
                    Entry {
                        count: 1,
                        window_end: now + WINDOW,
                    },
                );
                true
            }
        }
    }

    /// Remove entries whose window has already expired. Intended to run on
    /// a periodic background sweep every 60s.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, entry| entry.window_end >= now);
    }

    /// Spawn the periodic cleanup sweep as a background task.
    pub fn spawn_cleanup_task(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WINDOW);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                self.cleanup();
            }
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
