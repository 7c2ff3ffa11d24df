//! Cache statistics counters.
//!
//! Plain atomic counters maintained by the entry layer when statistics are
//! enabled. The event bus and continuous queries are separate collaborators;
//! these counters exist for cheap introspection and tests.

use crate::sync::{AtomicU64, Ordering};

/// Atomic operation counters for one cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read and whether it hit.
    pub fn on_read(&self, hit: bool) {
        self.reads.fetch_add(1, Ordering::Relaxed);

        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a committed write.
    pub fn on_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed removal.
    pub fn on_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an eviction.
    pub fn on_evict(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expiration.
    pub fn on_expired(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture a consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Total reads.
    pub reads: u64,
    /// Reads that found a value.
    pub hits: u64,
    /// Committed writes.
    pub writes: u64,
    /// Committed removals.
    pub removes: u64,
    /// Evictions.
    pub evictions: u64,
    /// Expirations.
    pub expirations: u64,
}

impl MetricsSnapshot {
    /// Reads that found nothing.
    pub fn misses(&self) -> u64 {
        self.reads.saturating_sub(self.hits)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = CacheMetrics::new();

        metrics.on_read(true);
        metrics.on_read(false);
        metrics.on_write();
        metrics.on_remove();
        metrics.on_evict();
        metrics.on_expired();

        let snap = metrics.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses(), 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.removes, 1);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.expirations, 1);
    }
}
