//! Disk-backed TTL memoisation for remote report fetches.
//!
//! The cache is strictly an optimisation. Every storage failure is logged,
//! counted as a fault, and degrades to "compute directly, skip the write";
//! nothing in this module returns a [`CacheFault`] to its callers.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{self, Clock};
use super::config::CacheConfig;
use super::disk::{CacheStore, EntryState, FsStore, StoredEntry};
use super::error::CacheFault;
use super::health::{CacheStats, HealthReport, RepairReport, hit_rate};
use super::keys::{CacheKey, CacheKeyBuilder, CacheNamespace};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::persistent";
/// Writes between re-measurements of the directory, so entries written by
/// other processes are eventually accounted for.
const USAGE_RESYNC_WRITES: u64 = 256;

/// What [`PersistentCache::invalidate`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidateScope {
    Key(CacheKey),
    Namespace(CacheNamespace),
    All,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    faults: AtomicU64,
}

/// Running estimate of bytes on disk. `bytes` is `None` until measured and
/// after anything removes entries.
#[derive(Debug, Default)]
struct UsageEstimate {
    bytes: Option<u64>,
    writes_since_sync: u64,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    /// Lookups share the gate; writes, culling and invalidation take it
    /// exclusively so a cull never races a write from this process.
    gate: RwLock<()>,
    usage: Mutex<UsageEstimate>,
    counters: Counters,
}

/// Cloneable handle; clones share storage, locking and statistics.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    inner: Arc<Inner>,
}

impl PersistentCache {
    /// Open the file-backed cache described by `config`.
    pub fn open(config: &CacheConfig) -> Self {
        let store = Arc::new(FsStore::new(config.directory.clone()));
        Self::with_store(store, config.clone(), clock::system())
    }

    pub fn with_store(store: Arc<dyn CacheStore>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                clock,
                gate: RwLock::new(()),
                usage: Mutex::new(UsageEstimate::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Default lifetime for query results.
    pub fn default_ttl(&self) -> Duration {
        self.inner.config.query_ttl()
    }

    /// Return the cached value for `key`, or run `compute` and remember its
    /// `Ok` result for `ttl`. Errors from `compute` are returned untouched and
    /// never cached.
    pub fn get_or_compute<T, E, F>(&self, key: &CacheKey, ttl: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        let value = compute()?;
        self.store(key, &value, ttl);
        Ok(value)
    }

    /// Async counterpart of [`PersistentCache::get_or_compute`]. Storage I/O
    /// runs on the blocking pool so the calling task never blocks.
    pub async fn get_or_compute_async<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_enabled() {
            let cache = self.clone();
            let lookup_key = key.clone();
            match tokio::task::spawn_blocking(move || cache.lookup::<T>(&lookup_key)).await {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {}
                Err(err) => self.record_fault("lookup", Some(key), &CacheFault::Task(err.to_string())),
            }
        }

        let value = compute().await?;

        if self.is_enabled() {
            match serde_json::to_value(&value) {
                Ok(json) => {
                    let cache = self.clone();
                    let store_key = key.clone();
                    let written =
                        tokio::task::spawn_blocking(move || cache.store_value(&store_key, json, ttl)).await;
                    if let Err(err) = written {
                        self.record_fault("store", Some(key), &CacheFault::Task(err.to_string()));
                    }
                }
                Err(err) => self.record_fault("store", Some(key), &CacheFault::Serialize(err)),
            }
        }

        Ok(value)
    }

    /// Read an unexpired entry. Misses, expired entries and faults all yield `None`.
    pub fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        let started_at = Instant::now();
        let loaded = {
            let _shared = rw_read(&self.inner.gate, SOURCE, "lookup");
            self.inner.store.load(key)
        };

        let entry = match loaded {
            Ok(Some(entry)) if !entry.is_expired(self.now()) => entry,
            Ok(_) => {
                self.record_miss(key, started_at);
                return None;
            }
            Err(fault) => {
                self.record_fault("lookup", Some(key), &fault);
                self.record_miss(key, started_at);
                return None;
            }
        };

        match serde_json::from_value::<T>(entry.value) {
            Ok(value) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!("relay_cache_hit_total", "namespace" => key.namespace().to_string()).increment(1);
                debug!(
                    target = "analytics_relay::cache::persistent",
                    op = "lookup",
                    namespace = %key.namespace(),
                    key = %key,
                    result = "cache_hit",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Served memoised result"
                );
                Some(value)
            }
            Err(err) => {
                let fault = CacheFault::corrupted(key.to_string(), err.to_string());
                self.record_fault("lookup", Some(key), &fault);
                self.record_miss(key, started_at);
                None
            }
        }
    }

    /// Remember `value` under `key` for `ttl`. Faults are logged and swallowed.
    pub fn store<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        if !self.is_enabled() {
            return;
        }
        match serde_json::to_value(value) {
            Ok(json) => self.store_value(key, json, ttl),
            Err(err) => self.record_fault("store", Some(key), &CacheFault::Serialize(err)),
        }
    }

    fn store_value(&self, key: &CacheKey, value: Value, ttl: Duration) {
        let now = self.now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = StoredEntry {
            key: key.to_string(),
            value,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };

        let saved = {
            let _exclusive = rw_write(&self.inner.gate, SOURCE, "store");
            self.inner.store.save(key, &entry)
        };
        match saved {
            Ok(bytes) => {
                self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
                counter!("relay_cache_write_total", "namespace" => key.namespace().to_string()).increment(1);
                debug!(
                    target = "analytics_relay::cache::persistent",
                    op = "store",
                    namespace = %key.namespace(),
                    key = %key,
                    result = "stored",
                    bytes,
                    ttl_secs = ttl.as_secs(),
                    "Memoised result written"
                );
                if self.note_write(bytes) {
                    self.enforce_size_limit();
                }
            }
            Err(fault) => self.record_fault("store", Some(key), &fault),
        }
    }

    /// Remove matching entries and return how many were removed. A scope that
    /// matches nothing is a no-op.
    pub fn invalidate(&self, scope: &InvalidateScope) -> usize {
        let removed = {
            let _exclusive = rw_write(&self.inner.gate, SOURCE, "invalidate");
            match scope {
                InvalidateScope::Key(key) => self.inner.store.remove(key).map(usize::from),
                InvalidateScope::Namespace(namespace) => self.inner.store.remove_namespace(namespace),
                InvalidateScope::All => self.inner.store.clear(),
            }
        };
        self.forget_usage();

        match removed {
            Ok(count) => {
                info!(
                    target = "analytics_relay::cache::persistent",
                    op = "invalidate",
                    scope = ?scope,
                    removed = count,
                    "Cache entries invalidated"
                );
                count
            }
            Err(fault) => {
                let key = match scope {
                    InvalidateScope::Key(key) => Some(key),
                    _ => None,
                };
                self.record_fault("invalidate", key, &fault);
                0
            }
        }
    }

    /// Drop expired and corrupted entries.
    pub fn repair(&self) -> RepairReport {
        let _exclusive = rw_write(&self.inner.gate, SOURCE, "repair");
        self.forget_usage();
        let metas = match self.inner.store.scan() {
            Ok(metas) => metas,
            Err(fault) => {
                self.record_fault("repair", None, &fault);
                return RepairReport::default();
            }
        };

        let now = self.now();
        let mut report = RepairReport::default();
        for meta in metas {
            let corrupted = meta.state == EntryState::Corrupted;
            if !corrupted && !meta.is_expired(now) {
                continue;
            }
            match self.inner.store.remove(&meta.key) {
                Ok(true) => {
                    if corrupted {
                        report.corrupted_removed += 1;
                    } else {
                        report.expired_removed += 1;
                    }
                    report.bytes_freed = report.bytes_freed.saturating_add(meta.size_bytes);
                }
                Ok(false) => {}
                Err(fault) => self.record_fault("repair", Some(&meta.key), &fault),
            }
        }

        info!(
            target = "analytics_relay::cache::persistent",
            op = "repair",
            expired_removed = report.expired_removed,
            corrupted_removed = report.corrupted_removed,
            bytes_freed = report.bytes_freed,
            "Cache repair finished"
        );
        report
    }

    /// Inspect the backend without modifying user entries. Never panics or
    /// returns an error; problems are listed in `issues`.
    pub fn health_check(&self) -> HealthReport {
        let mut report = HealthReport {
            enabled: self.is_enabled(),
            ..HealthReport::default()
        };

        match self.inner.store.scan() {
            Ok(metas) => {
                let now = self.now();
                for meta in &metas {
                    report.size_bytes = report.size_bytes.saturating_add(meta.size_bytes);
                    if meta.state == EntryState::Corrupted {
                        report.corrupted_entries += 1;
                    } else if meta.is_expired(now) {
                        report.expired_entries += 1;
                    }
                }
                report.entry_count = metas.len();
            }
            Err(fault) => report.issues.push(format!("failed to scan cache storage: {fault}")),
        }

        let limit = self.inner.config.size_limit_bytes;
        if report.size_bytes > limit {
            report.issues.push(format!(
                "cache size {} bytes exceeds limit of {limit} bytes",
                report.size_bytes
            ));
        }
        if report.corrupted_entries > 0 {
            report
                .issues
                .push(format!("{} corrupted entries found", report.corrupted_entries));
        }

        if report.enabled {
            match self.round_trip_probe() {
                Ok(()) => report.round_trip_ok = true,
                Err(reason) => report.issues.push(format!("round-trip probe failed: {reason}")),
            }
        }

        report.overall_healthy = report.issues.is_empty();
        report
    }

    fn round_trip_probe(&self) -> Result<(), String> {
        let token = Uuid::new_v4().to_string();
        let key = CacheKeyBuilder::new(CacheNamespace::HEALTH_PROBE)
            .arg(token.as_str())
            .build();
        let now = self.now();
        let entry = StoredEntry {
            key: key.to_string(),
            value: Value::String(token.clone()),
            created_at: now,
            expires_at: now.saturating_add(60_000),
        };

        let _exclusive = rw_write(&self.inner.gate, SOURCE, "health_check");
        let store = &self.inner.store;
        store.save(&key, &entry).map_err(|fault| format!("write: {fault}"))?;
        let read = store.load(&key);
        let removed = store.remove(&key);

        match read.map_err(|fault| format!("read: {fault}"))? {
            Some(found) if found.value == Value::String(token) => {}
            Some(_) => return Err("read back a different value".to_string()),
            None => return Err("entry vanished after write".to_string()),
        }
        match removed {
            Ok(true) => Ok(()),
            Ok(false) => Err("delete found no entry".to_string()),
            Err(fault) => Err(format!("delete: {fault}")),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            writes: counters.writes.load(Ordering::Relaxed),
            faults: counters.faults.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
        }
    }

    pub fn reset_stats(&self) {
        let counters = &self.inner.counters;
        counters.hits.store(0, Ordering::Relaxed);
        counters.misses.store(0, Ordering::Relaxed);
        counters.writes.store(0, Ordering::Relaxed);
        counters.faults.store(0, Ordering::Relaxed);
    }

    /// Add a successful write to the usage estimate and report whether the
    /// limit is now exceeded. The directory is only walked on the first write,
    /// every [`USAGE_RESYNC_WRITES`] writes, and after removals.
    fn note_write(&self, bytes: u64) -> bool {
        let estimate = {
            let mut usage = mutex_lock(&self.inner.usage, SOURCE, "usage");
            usage.writes_since_sync += 1;
            match usage.bytes {
                Some(known) if usage.writes_since_sync < USAGE_RESYNC_WRITES => {
                    let estimate = known.saturating_add(bytes);
                    usage.bytes = Some(estimate);
                    Some(estimate)
                }
                _ => None,
            }
        };
        match estimate.or_else(|| self.measure_usage()) {
            Some(estimate) => estimate > self.inner.config.size_limit_bytes,
            None => false,
        }
    }

    fn measure_usage(&self) -> Option<u64> {
        let measured = {
            let _shared = rw_read(&self.inner.gate, SOURCE, "usage");
            self.inner.store.usage_bytes()
        };
        match measured {
            Ok(bytes) => {
                self.set_usage(Some(bytes));
                Some(bytes)
            }
            Err(fault) => {
                self.set_usage(None);
                self.record_fault("usage", None, &fault);
                None
            }
        }
    }

    fn set_usage(&self, bytes: Option<u64>) {
        let mut usage = mutex_lock(&self.inner.usage, SOURCE, "usage");
        usage.bytes = bytes;
        usage.writes_since_sync = 0;
    }

    fn forget_usage(&self) {
        self.set_usage(None);
    }

    /// Cull expired entries first, then the oldest, until usage fits the limit.
    fn enforce_size_limit(&self) {
        let limit = self.inner.config.size_limit_bytes;
        let _exclusive = rw_write(&self.inner.gate, SOURCE, "cull");
        let store = &self.inner.store;

        let mut metas = match store.scan() {
            Ok(metas) => metas,
            Err(fault) => {
                self.forget_usage();
                self.record_fault("cull", None, &fault);
                return;
            }
        };
        let mut usage = metas.iter().fold(0u64, |total, meta| total.saturating_add(meta.size_bytes));
        if usage <= limit {
            self.set_usage(Some(usage));
            return;
        }

        let now = self.now();
        // Corrupted and expired entries sort before live ones; ties by age.
        metas.sort_by_key(|meta| match meta.state {
            EntryState::Corrupted => (0, i64::MIN),
            EntryState::Valid { expires_at, .. } if expires_at <= now => (0, expires_at),
            EntryState::Valid { created_at, .. } => (1, created_at),
        });

        let mut culled = 0usize;
        for meta in metas {
            if usage <= limit {
                break;
            }
            match store.remove(&meta.key) {
                Ok(true) => {
                    usage = usage.saturating_sub(meta.size_bytes);
                    culled += 1;
                }
                Ok(false) => {}
                Err(fault) => self.record_fault("cull", Some(&meta.key), &fault),
            }
        }
        self.set_usage(Some(usage));

        info!(
            target = "analytics_relay::cache::persistent",
            op = "cull",
            culled,
            usage_bytes = usage,
            limit_bytes = limit,
            "Cache trimmed to size limit"
        );
    }

    fn record_miss(&self, key: &CacheKey, started_at: Instant) {
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!("relay_cache_miss_total", "namespace" => key.namespace().to_string()).increment(1);
        debug!(
            target = "analytics_relay::cache::persistent",
            op = "lookup",
            namespace = %key.namespace(),
            key = %key,
            result = "cache_miss",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "No usable memoised result"
        );
    }

    fn record_fault(&self, op: &'static str, key: Option<&CacheKey>, fault: &CacheFault) {
        self.inner.counters.faults.fetch_add(1, Ordering::Relaxed);
        let namespace = key
            .map(|key| key.namespace().to_string())
            .unwrap_or_else(|| "*".to_string());
        let key = key.map(ToString::to_string);
        counter!("relay_cache_fault_total", "namespace" => namespace.clone()).increment(1);
        warn!(
            target = "analytics_relay::cache::persistent",
            op,
            namespace = %namespace,
            key = key.as_deref(),
            result = "cache_fault",
            error_code = fault.code(),
            error = %fault,
            "Cache storage fault; continuing without cache"
        );
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::disk::EntryMeta;

    fn cache_in(dir: &TempDir, clock: &ManualClock) -> PersistentCache {
        PersistentCache::with_store(
            Arc::new(FsStore::new(dir.path())),
            CacheConfig::at(dir.path()),
            Arc::new(clock.clone()),
        )
    }

    fn key(target: &str) -> CacheKey {
        CacheKeyBuilder::new(CacheNamespace::GA4_REPORT)
            .arg(target)
            .kwarg("start_date", "2024-01-01")
            .build()
    }

    /// Fails every operation.
    #[derive(Debug)]
    struct BrokenStore;

    fn broken() -> CacheFault {
        CacheFault::io("/dev/broken", io::Error::other("disk on fire"))
    }

    impl CacheStore for BrokenStore {
        fn load(&self, _: &CacheKey) -> Result<Option<StoredEntry>, CacheFault> {
            Err(broken())
        }
        fn save(&self, _: &CacheKey, _: &StoredEntry) -> Result<u64, CacheFault> {
            Err(broken())
        }
        fn remove(&self, _: &CacheKey) -> Result<bool, CacheFault> {
            Err(broken())
        }
        fn remove_namespace(&self, _: &CacheNamespace) -> Result<usize, CacheFault> {
            Err(broken())
        }
        fn clear(&self) -> Result<usize, CacheFault> {
            Err(broken())
        }
        fn scan(&self) -> Result<Vec<EntryMeta>, CacheFault> {
            Err(broken())
        }
        fn usage_bytes(&self) -> Result<u64, CacheFault> {
            Err(broken())
        }
    }

    #[test]
    fn compute_runs_once_within_ttl_and_again_after_expiry() {
        let dir = TempDir::new().expect("temp dir");
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let cache = cache_in(&dir, &clock);
        let calls = Cell::new(0);
        let fetch = || -> Result<Vec<u32>, io::Error> {
            calls.set(calls.get() + 1);
            Ok(vec![1, 2, 3])
        };
        let ttl = Duration::from_secs(3600);

        assert_eq!(cache.get_or_compute(&key("1"), ttl, fetch).expect("first"), vec![1, 2, 3]);
        assert_eq!(cache.get_or_compute(&key("1"), ttl, fetch).expect("second"), vec![1, 2, 3]);
        assert_eq!(calls.get(), 1);

        clock.advance_secs(3599);
        cache.get_or_compute(&key("1"), ttl, fetch).expect("still fresh");
        assert_eq!(calls.get(), 1);

        clock.advance_secs(1);
        cache.get_or_compute(&key("1"), ttl, fetch).expect("expired");
        assert_eq!(calls.get(), 2);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes, stats.faults), (2, 2, 2, 0));
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn errors_are_returned_and_not_cached() {
        let dir = TempDir::new().expect("temp dir");
        let clock = ManualClock::starting_at(0);
        let cache = cache_in(&dir, &clock);
        let ttl = cache.default_ttl();

        let failed: Result<u8, String> = cache.get_or_compute(&key("1"), ttl, || Err("quota".to_string()));
        assert_eq!(failed, Err("quota".to_string()));

        let calls = Cell::new(0);
        let ok: Result<u8, String> = cache.get_or_compute(&key("1"), ttl, || {
            calls.set(calls.get() + 1);
            Ok(7)
        });
        assert_eq!(ok, Ok(7));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn broken_storage_never_fails_the_call() {
        let cache = PersistentCache::with_store(
            Arc::new(BrokenStore),
            CacheConfig::default(),
            Arc::new(ManualClock::starting_at(0)),
        );
        let calls = Cell::new(0);
        for _ in 0..2 {
            let value: Result<String, io::Error> =
                cache.get_or_compute(&key("1"), Duration::from_secs(60), || {
                    calls.set(calls.get() + 1);
                    Ok("fresh".to_string())
                });
            assert_eq!(value.expect("compute result"), "fresh");
        }
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.invalidate(&InvalidateScope::All), 0);
        assert_eq!(cache.repair(), RepairReport::default());

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert!(stats.faults >= 4);

        let health = cache.health_check();
        assert!(!health.overall_healthy);
        assert!(!health.round_trip_ok);
        assert!(health.issues.iter().any(|issue| issue.contains("round-trip")));
    }

    #[test]
    fn corrupted_entry_is_a_miss_and_is_overwritten() {
        let dir = TempDir::new().expect("temp dir");
        let clock = ManualClock::starting_at(0);
        let cache = cache_in(&dir, &clock);
        let key = key("1");
        let ns_dir = dir.path().join("ga4_report");
        std::fs::create_dir_all(&ns_dir).expect("mkdir");
        std::fs::write(ns_dir.join(format!("{}.json", key.digest())), b"\x00\x01").expect("write");

        let value: Result<u8, io::Error> = cache.get_or_compute(&key, Duration::from_secs(60), || Ok(9));
        assert_eq!(value.expect("computed"), 9);
        assert_eq!(cache.stats().faults, 1);
        assert_eq!(cache.lookup::<u8>(&key), Some(9));
    }

    #[test]
    fn type_mismatch_counts_as_fault_not_panic() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache_in(&dir, &ManualClock::starting_at(0));
        cache.store(&key("1"), &json!({"rows": []}), Duration::from_secs(60));
        assert_eq!(cache.lookup::<Vec<u8>>(&key("1")), None);
        assert_eq!(cache.stats().faults, 1);
    }

    #[test]
    fn invalidate_by_key_namespace_and_all() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache_in(&dir, &ManualClock::starting_at(0));
        let ttl = Duration::from_secs(60);
        let gsc = CacheKeyBuilder::new(CacheNamespace::GSC_REPORT).arg("example.com").build();
        cache.store(&key("1"), &1, ttl);
        cache.store(&key("2"), &2, ttl);
        cache.store(&gsc, &3, ttl);

        assert_eq!(cache.invalidate(&InvalidateScope::Key(key("1"))), 1);
        assert_eq!(cache.invalidate(&InvalidateScope::Key(key("1"))), 0);
        assert_eq!(
            cache.invalidate(&InvalidateScope::Namespace(CacheNamespace::GA4_REPORT)),
            1
        );
        assert_eq!(cache.lookup::<u8>(&gsc), Some(3));
        assert_eq!(cache.invalidate(&InvalidateScope::All), 1);
        assert_eq!(cache.invalidate(&InvalidateScope::All), 0);
    }

    #[test]
    fn repair_removes_expired_and_corrupted_entries() {
        let dir = TempDir::new().expect("temp dir");
        let clock = ManualClock::starting_at(0);
        let cache = cache_in(&dir, &clock);
        cache.store(&key("short"), &1, Duration::from_secs(10));
        cache.store(&key("long"), &2, Duration::from_secs(1000));
        let bogus = dir.path().join("gsc_report");
        std::fs::create_dir_all(&bogus).expect("mkdir");
        std::fs::write(bogus.join("deadbeef.json"), b"nope").expect("write");

        clock.advance_secs(11);
        let health = cache.health_check();
        assert_eq!(health.entry_count, 3);
        assert_eq!(health.expired_entries, 1);
        assert_eq!(health.corrupted_entries, 1);
        assert!(!health.overall_healthy);
        assert!(health.round_trip_ok);

        let report = cache.repair();
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.corrupted_removed, 1);
        assert_eq!(cache.lookup::<u8>(&key("long")), Some(2));

        let health = cache.health_check();
        assert!(health.overall_healthy, "issues: {:?}", health.issues);
        assert_eq!(health.entry_count, 1);
    }

    #[test]
    fn health_probe_leaves_no_entries_behind() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache_in(&dir, &ManualClock::starting_at(0));
        let report = cache.health_check();
        assert!(report.overall_healthy);
        assert!(report.round_trip_ok);
        assert_eq!(report.entry_count, 0);
        assert_eq!(cache.health_check().entry_count, 0);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn size_limit_culls_oldest_entries_first() {
        let dir = TempDir::new().expect("temp dir");
        let clock = ManualClock::starting_at(0);
        let mut config = CacheConfig::at(dir.path());
        let payload = "x".repeat(400);
        // Room for two entries but not three.
        config.size_limit_bytes = 1_200;
        let cache = PersistentCache::with_store(
            Arc::new(FsStore::new(dir.path())),
            config,
            Arc::new(clock.clone()),
        );
        let ttl = Duration::from_secs(3600);

        for target in ["a", "b", "c"] {
            cache.store(&key(target), &payload, ttl);
            clock.advance_secs(1);
        }

        assert_eq!(cache.lookup::<String>(&key("a")), None);
        assert_eq!(cache.lookup::<String>(&key("b")).as_deref(), Some(payload.as_str()));
        assert_eq!(cache.lookup::<String>(&key("c")).as_deref(), Some(payload.as_str()));
        assert!(cache.health_check().size_bytes <= 1_200);
    }

    /// Counts directory walks on top of a real store.
    #[derive(Debug)]
    struct WalkCounting {
        inner: FsStore,
        walks: AtomicU64,
    }

    impl CacheStore for WalkCounting {
        fn load(&self, key: &CacheKey) -> Result<Option<StoredEntry>, CacheFault> {
            self.inner.load(key)
        }
        fn save(&self, key: &CacheKey, entry: &StoredEntry) -> Result<u64, CacheFault> {
            self.inner.save(key, entry)
        }
        fn remove(&self, key: &CacheKey) -> Result<bool, CacheFault> {
            self.inner.remove(key)
        }
        fn remove_namespace(&self, namespace: &CacheNamespace) -> Result<usize, CacheFault> {
            self.inner.remove_namespace(namespace)
        }
        fn clear(&self) -> Result<usize, CacheFault> {
            self.inner.clear()
        }
        fn scan(&self) -> Result<Vec<EntryMeta>, CacheFault> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            self.inner.scan()
        }
        fn usage_bytes(&self) -> Result<u64, CacheFault> {
            self.walks.fetch_add(1, Ordering::SeqCst);
            self.inner.usage_bytes()
        }
    }

    #[test]
    fn writes_under_the_limit_do_not_walk_the_directory() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(WalkCounting {
            inner: FsStore::new(dir.path()),
            walks: AtomicU64::new(0),
        });
        let cache = PersistentCache::with_store(
            store.clone(),
            CacheConfig::at(dir.path()),
            Arc::new(ManualClock::starting_at(0)),
        );
        let ttl = Duration::from_secs(60);

        for n in 0..50 {
            cache.store(&key(&n.to_string()), &n, ttl);
        }
        assert_eq!(store.walks.load(Ordering::SeqCst), 1);

        assert_eq!(cache.invalidate(&InvalidateScope::Key(key("0"))), 1);
        cache.store(&key("0"), &0, ttl);
        cache.store(&key("1"), &1, ttl);
        assert_eq!(store.walks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn size_limit_holds_across_many_small_writes() {
        let dir = TempDir::new().expect("temp dir");
        let clock = ManualClock::starting_at(0);
        let mut config = CacheConfig::at(dir.path());
        config.size_limit_bytes = 2_000;
        let cache = PersistentCache::with_store(
            Arc::new(FsStore::new(dir.path())),
            config,
            Arc::new(clock.clone()),
        );

        for n in 0..40 {
            cache.store(&key(&n.to_string()), &"y".repeat(100), Duration::from_secs(3600));
            clock.advance_secs(1);
        }

        let health = cache.health_check();
        assert!(health.size_bytes <= 2_000, "{health:?}");
        assert!(cache.lookup::<String>(&key("39")).is_some());
        assert!(cache.lookup::<String>(&key("0")).is_none());
    }

    #[test]
    fn disabled_cache_always_computes() {
        let dir = TempDir::new().expect("temp dir");
        let mut config = CacheConfig::at(dir.path());
        config.enabled = false;
        let cache = PersistentCache::with_store(
            Arc::new(FsStore::new(dir.path())),
            config,
            Arc::new(ManualClock::starting_at(0)),
        );
        let calls = Cell::new(0);
        for _ in 0..2 {
            let _: Result<u8, io::Error> = cache.get_or_compute(&key("1"), Duration::from_secs(60), || {
                calls.set(calls.get() + 1);
                Ok(1)
            });
        }
        assert_eq!(calls.get(), 2);
        assert!(!cache.health_check().enabled);
    }

    #[tokio::test]
    async fn async_path_memoises_through_blocking_pool() {
        let dir = TempDir::new().expect("temp dir");
        let cache = cache_in(&dir, &ManualClock::starting_at(0));
        let calls = &AtomicU64::new(0);
        let ttl = Duration::from_secs(60);

        for _ in 0..3 {
            let rows: Result<Vec<String>, io::Error> = cache
                .get_or_compute_async(&key("1"), ttl, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["row".to_string()])
                })
                .await;
            assert_eq!(rows.expect("rows"), vec!["row".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 2);
    }
}
