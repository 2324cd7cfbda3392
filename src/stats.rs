//! Thread-safe connection counters consumed by the observability sidecar.
//!
//! Mutated only through the narrow methods below (`record_admission`,
//! `record_success`, `record_failure`); the admin sidecar only ever sees a
//! deep-copied, read-only [`StatsSnapshot`].

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Stats {
    start: Instant,
    total: AtomicU64,
    active: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    domains: DashMap<String, u64>,
    sources: DashMap<String, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            total: AtomicU64::new(0),
            active: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            domains: DashMap::new(),
            sources: DashMap::new(),
        }
    }

    /// Record admission of a connection: it passed address policy, rate
    /// limiting, and SNI parsing. Counted against `domains`/`sources` even
    /// if the route table later denies it: the domain is counted at
    /// admission time, before the route-table check.
    pub fn record_admission(&self, source_addr: &str, sni: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        *self.domains.entry(sni.to_string()).or_insert(0) += 1;
        *self.sources.entry(source_addr.to_string()).or_insert(0) += 1;
    }

    pub fn record_success(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure that occurred before admission (IP denied, rate
    /// limited): `total`/`active` are never incremented for these, since
    /// every `total++` implies the source address passed both the allow-list
    /// and the rate limiter.
    pub fn record_pre_admission_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// A deep, consistent copy of the current counters. The consumer must
    /// never observe a torn read across `total`/`active`/`successful`/
    /// `failed`, so snapshot order is fixed: total, then active, successful,
    /// failed are all relaxed-loaded together before anything else changes
    /// them meaningfully for the purposes of a point-in-time report.
    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let active = self.active.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);

        let domains: std::collections::HashMap<String, u64> = self
            .domains
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let mut top_ips: Vec<TopSource> = self
            .sources
            .iter()
            .map(|e| TopSource {
                ip: e.key().clone(),
                count: *e.value(),
            })
            .collect();
        top_ips.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.ip.cmp(&b.ip)));
        top_ips.truncate(5);

        StatsSnapshot {
            uptime_ms: self.uptime_ms(),
            total,
            active,
            successful,
            failed,
            domains,
            top_ips,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopSource {
    pub ip: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_ms: u64,
    pub total: u64,
    pub active: u64,
    pub successful: u64,
    pub failed: u64,
    pub domains: std::collections::HashMap<String, u64>,
    pub top_ips: Vec<TopSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_equals_total_minus_successful_minus_failed() {
        let stats = Stats::new();
        stats.record_admission("1.1.1.1", "example.com");
        stats.record_admission("2.2.2.2", "example.com");
        stats.record_success();
        stats.record_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.successful, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.active, snap.total - snap.successful - snap.failed);
        assert_eq!(snap.active, 0);
    }

    #[test]
    fn pre_admission_failure_does_not_touch_total_or_active() {
        let stats = Stats::new();
        stats.record_pre_admission_failure();
        let snap = stats.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.active, 0);
        assert_eq!(snap.failed, 1);
    }

    #[test]
    fn domain_counted_at_admission_even_if_route_denied_later() {
        let stats = Stats::new();
        stats.record_admission("1.1.1.1", "example.com");
        stats.record_failure(); // SniNotAllowed
        let snap = stats.snapshot();
        assert_eq!(*snap.domains.get("example.com").unwrap(), 1);
        assert_eq!(snap.failed, 1);
    }

    #[test]
    fn top_ips_sorted_descending_and_capped_at_five() {
        let stats = Stats::new();
        for i in 0..7u8 {
            for _ in 0..=i {
                stats.record_admission(&format!("10.0.0.{i}"), "host");
            }
        }
        let snap = stats.snapshot();
        assert_eq!(snap.top_ips.len(), 5);
        assert_eq!(snap.top_ips[0].ip, "10.0.0.6");
        assert_eq!(snap.top_ips[0].count, 7);
        assert!(snap.top_ips.windows(2).all(|w| w[0].count >= w[1].count));
    }
}
