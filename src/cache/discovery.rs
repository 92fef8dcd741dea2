//! Bounded in-memory cache for per-account discovery lists.
//!
//! Listing the properties or sites an account can see is slow upstream but
//! changes rarely, so lists are held for a day by default. The whole map sits
//! behind one mutex; the lock is never held across an await.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use tracing::{debug, info};

use super::clock::{self, Clock};
use super::config::CacheConfig;
use super::health::{DiscoveryHealth, DiscoveryStats, hit_rate};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::discovery";

#[derive(Debug, Clone)]
struct DiscoveryEntry {
    targets: Vec<String>,
    fetched_at: i64,
    expires_at: i64,
}

impl DiscoveryEntry {
    fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }
}

#[derive(Debug)]
pub struct DiscoveryCache {
    entries: Mutex<LruCache<String, DiscoveryEntry>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    max_entries: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(max_entries: NonZeroUsize, default_ttl: Duration) -> Self {
        Self::with_clock(max_entries, default_ttl, clock::system())
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.discovery_max_entries_non_zero(), config.discovery_ttl())
    }

    pub fn with_clock(max_entries: NonZeroUsize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_entries)),
            clock,
            default_ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unexpired list for `account`. A hit counts as a use for LRU recency;
    /// an expired entry is a miss and keeps its position.
    pub fn get(&self, account: &str) -> Option<Vec<String>> {
        let now = self.clock.now_millis();
        let found = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "get");
            match entries.peek(account) {
                Some(entry) if !entry.is_expired(now) => {
                    let targets = entry.targets.clone();
                    entries.promote(account);
                    Some(targets)
                }
                _ => None,
            }
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!("relay_discovery_hit_total").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("relay_discovery_miss_total").increment(1);
        }
        debug!(
            target = "analytics_relay::cache::discovery",
            op = "get",
            account,
            result = if found.is_some() { "cache_hit" } else { "cache_miss" },
            "Discovery cache lookup"
        );
        found
    }

    /// Insert or replace `account`'s list. `ttl` of `None` uses the default.
    pub fn put(&self, account: &str, targets: Vec<String>, ttl: Option<Duration>) {
        let now = self.clock.now_millis();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = DiscoveryEntry {
            targets,
            fetched_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };

        let evicted = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "put");
            entries.push(account.to_string(), entry)
        };

        // `push` also hands back the previous value when replacing a key.
        if let Some((evicted_key, evicted_entry)) = evicted.filter(|(key, _)| key != account) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            counter!("relay_discovery_evict_total").increment(1);
            info!(
                target = "analytics_relay::cache::discovery",
                op = "put",
                account,
                evicted = %evicted_key,
                evicted_age_ms = now.saturating_sub(evicted_entry.fetched_at),
                result = "evicted_lru",
                "Discovery cache full; evicted least recently used account"
            );
        }
    }

    /// Drop one account (`Some`) or everything (`None`). Returns removed count.
    pub fn invalidate(&self, account: Option<&str>) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate");
        match account {
            Some(account) => usize::from(entries.pop(account).is_some()),
            None => {
                let removed = entries.len();
                entries.clear();
                removed
            }
        }
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = mutex_lock(&self.entries, SOURCE, "purge_expired");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(account, _)| account.clone())
            .collect();
        for account in &expired {
            entries.pop(account);
        }
        expired.len()
    }

    pub fn stats(&self) -> DiscoveryStats {
        let now = self.clock.now_millis();
        let (total_entries, expired_entries) = {
            let entries = mutex_lock(&self.entries, SOURCE, "stats");
            let expired = entries.iter().filter(|(_, entry)| entry.is_expired(now)).count();
            (entries.len(), expired)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        DiscoveryStats {
            total_entries,
            valid_entries: total_entries - expired_entries,
            expired_entries,
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            evictions: self.evictions.load(Ordering::Relaxed),
            max_entries: self.max_entries.get(),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn health_check(&self) -> DiscoveryHealth {
        let stats = self.stats();
        let mut issues = Vec::new();
        if stats.total_entries > stats.max_entries {
            issues.push(format!(
                "{} entries exceed the configured maximum of {}",
                stats.total_entries, stats.max_entries
            ));
        }
        if stats.expired_entries > stats.valid_entries {
            issues.push(format!(
                "{} expired entries outnumber {} valid entries; purge recommended",
                stats.expired_entries, stats.valid_entries
            ));
        }
        DiscoveryHealth {
            overall_healthy: issues.is_empty(),
            issues,
            stats,
        }
    }

    /// Serve `account` from cache, or run `discover` and remember a non-empty
    /// result. With `use_cache == false` the read is skipped but the fresh
    /// result still replaces the cached one.
    pub async fn get_or_discover<E, F, Fut>(
        &self,
        account: &str,
        ttl: Option<Duration>,
        use_cache: bool,
        discover: F,
    ) -> Result<Vec<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
    {
        if use_cache && let Some(hit) = self.get(account) {
            return Ok(hit);
        }

        let targets = discover().await?;
        if targets.is_empty() {
            debug!(
                target = "analytics_relay::cache::discovery",
                op = "get_or_discover",
                account,
                result = "empty_not_cached",
                "Discovery returned no targets"
            );
        } else {
            self.put(account, targets.clone(), ttl);
        }
        Ok(targets)
    }
}
