//! Shapes exposed to the operational status surface.

use serde::Serialize;

/// Cumulative persistent-cache counters since start or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub faults: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall_healthy: bool,
    pub issues: Vec<String>,
    pub size_bytes: u64,
    pub entry_count: usize,
    pub expired_entries: usize,
    pub corrupted_entries: usize,
    pub round_trip_ok: bool,
    pub enabled: bool,
}

/// Outcome of [`super::PersistentCache::repair`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub expired_removed: usize,
    pub corrupted_removed: usize,
    pub bytes_freed: u64,
}

impl RepairReport {
    pub fn total_removed(&self) -> usize {
        self.expired_removed + self.corrupted_removed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DiscoveryStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryHealth {
    pub overall_healthy: bool,
    pub issues: Vec<String>,
    pub stats: DiscoveryStats,
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
