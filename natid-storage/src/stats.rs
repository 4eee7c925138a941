//! Natural-key resolution statistics.
//!
//! Lock-free atomic counters, shared by every unit of work of one
//! coordinator. Counters only move while statistics are enabled and only
//! go back to zero through [`ResolutionStatistics::clear`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Statistics sink exposed to callers.
#[derive(Debug, Default)]
pub struct ResolutionStatistics {
    enabled: AtomicBool,
    query_executions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_puts: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub query_execution_count: u64,
    pub cache_hit_count: u64,
    pub cache_miss_count: u64,
    pub cache_put_count: u64,
}

impl StatisticsSnapshot {
    /// Shared-tier hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hit_count + self.cache_miss_count;
        if total == 0 {
            0.0
        } else {
            self.cache_hit_count as f64 / total as f64
        }
    }
}

impl ResolutionStatistics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Store lookups by natural key.
    pub fn query_execution_count(&self) -> u64 {
        self.query_executions.load(Ordering::Relaxed)
    }

    /// Resolutions answered by the shared tier.
    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Shared-tier lookups that found nothing.
    pub fn cache_miss_count(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Mappings promoted into the shared tier.
    pub fn cache_put_count(&self) -> u64 {
        self.cache_puts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            query_execution_count: self.query_execution_count(),
            cache_hit_count: self.cache_hit_count(),
            cache_miss_count: self.cache_miss_count(),
            cache_put_count: self.cache_put_count(),
        }
    }

    /// Reset every counter to zero. The enabled flag is left as is.
    pub fn clear(&self) {
        self.query_executions.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.cache_puts.store(0, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64, by: u64) {
        if by > 0 && self.is_enabled() {
            counter.fetch_add(by, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_query_execution(&self) {
        self.bump(&self.query_executions, 1);
    }

    pub(crate) fn record_hit(&self) {
        self.bump(&self.cache_hits, 1);
    }

    pub(crate) fn record_miss(&self) {
        self.bump(&self.cache_misses, 1);
    }

    pub(crate) fn record_puts(&self, count: u64) {
        self.bump(&self.cache_puts, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_statistics_do_not_move() {
        let stats = ResolutionStatistics::new(false);
        stats.record_query_execution();
        stats.record_hit();
        stats.record_puts(3);
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_counters_and_clear() {
        let stats = ResolutionStatistics::new(true);
        stats.record_query_execution();
        stats.record_query_execution();
        stats.record_hit();
        stats.record_miss();
        stats.record_puts(2);

        assert_eq!(stats.query_execution_count(), 2);
        assert_eq!(stats.cache_hit_count(), 1);
        assert_eq!(stats.cache_miss_count(), 1);
        assert_eq!(stats.cache_put_count(), 2);
        assert!((stats.snapshot().hit_rate() - 0.5).abs() < 0.001);

        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
        assert!(stats.is_enabled());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ResolutionStatistics::new(true);
        stats.record_query_execution();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["query_execution_count"], 1);
        assert_eq!(json["cache_put_count"], 0);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert!((StatisticsSnapshot::default().hit_rate() - 0.0).abs() < 0.001);
    }
}
