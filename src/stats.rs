use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

/// Runtime counters mutated by the data path. Increments are atomic and
/// monotone; persistence happens through periodic [`StatsSnapshot`] flushes.
#[derive(Clone, Debug, Default)]
pub(crate) struct Stats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    requests_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    bytes_served: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct StatsSnapshot {
    pub(crate) requests_total: u64,
    pub(crate) cache_hits: u64,
    pub(crate) cache_misses: u64,
    pub(crate) bytes_served: u64,
}

impl Stats {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_requests(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cache_hits(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cache_misses(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_served(&self, bytes: u64) {
        self.inner.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            bytes_served: self.inner.bytes_served.load(Ordering::Relaxed),
        }
    }

    /// Restores counters from a persisted snapshot at startup.
    pub(crate) fn restore(&self, snapshot: &StatsSnapshot) {
        self.inner
            .requests_total
            .store(snapshot.requests_total, Ordering::Relaxed);
        self.inner
            .cache_hits
            .store(snapshot.cache_hits, Ordering::Relaxed);
        self.inner
            .cache_misses
            .store(snapshot.cache_misses, Ordering::Relaxed);
        self.inner
            .bytes_served
            .store(snapshot.bytes_served, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct GroupUsage {
    pub(crate) files: u64,
    pub(crate) size: u64,
}

/// Per-group file counts and sizes, recomputed periodically by the cache scan
/// task. Feeds the dashboard only and never gates the data path.
#[derive(Clone, Debug, Default)]
pub(crate) struct FileStats {
    inner: Arc<RwLock<FileStatsInner>>,
}

#[derive(Debug, Default)]
struct FileStatsInner {
    total_files: u64,
    total_size: u64,
    groups: BTreeMap<String, GroupUsage>,
}

impl FileStats {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn replace(&self, groups: BTreeMap<String, GroupUsage>) {
        let total_files = groups.values().map(|usage| usage.files).sum();
        let total_size = groups.values().map(|usage| usage.size).sum();

        let mut inner = self.inner.write().expect("other users should not panic");
        inner.total_files = total_files;
        inner.total_size = total_size;
        inner.groups = groups;
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> (u64, u64, BTreeMap<String, GroupUsage>) {
        let inner = self.inner.read().expect("other users should not panic");
        (inner.total_files, inner.total_size, inner.groups.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();

        stats.inc_requests();
        stats.inc_requests();
        stats.inc_cache_hits();
        stats.inc_cache_misses();
        stats.add_bytes_served(1024);
        stats.add_bytes_served(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.bytes_served, 1025);

        assert!(snapshot.requests_total >= snapshot.cache_hits + snapshot.cache_misses);
    }

    #[test]
    fn restore_round_trips() {
        let stats = Stats::new();
        let snapshot = StatsSnapshot {
            requests_total: 10,
            cache_hits: 4,
            cache_misses: 6,
            bytes_served: 12345,
        };

        stats.restore(&snapshot);
        assert_eq!(stats.snapshot(), snapshot);

        stats.inc_requests();
        assert_eq!(stats.snapshot().requests_total, 11);
    }

    #[test]
    fn file_stats_totals_follow_groups() {
        let file_stats = FileStats::new();

        let mut groups = BTreeMap::new();
        groups.insert("debian".to_string(), GroupUsage { files: 2, size: 100 });
        groups.insert("ubuntu".to_string(), GroupUsage { files: 3, size: 50 });
        file_stats.replace(groups);

        let (files, size, groups) = file_stats.snapshot();
        assert_eq!(files, 5);
        assert_eq!(size, 150);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["debian"], GroupUsage { files: 2, size: 100 });
    }
}
