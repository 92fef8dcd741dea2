use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use analytics_relay::cache::{
    CacheConfig, CacheKey, CacheKeyBuilder, CacheNamespace, DiscoveryCache, FsStore, InvalidateScope,
    ManualClock, PersistentCache,
};
use tempfile::TempDir;

const START_MS: i64 = 1_704_067_200_000;

fn key(property: &str) -> CacheKey {
    CacheKeyBuilder::new(CacheNamespace::GA4_REPORT)
        .arg(property)
        .kwarg("start_date", "2024-01-01")
        .kwarg("end_date", "2024-01-31")
        .build()
}

fn cache_with_clock(dir: &TempDir, clock: &ManualClock) -> PersistentCache {
    PersistentCache::with_store(
        Arc::new(FsStore::new(dir.path())),
        CacheConfig::at(dir.path()),
        Arc::new(clock.clone()),
    )
}

#[test]
fn entries_written_by_one_handle_are_visible_to_another() {
    let dir = TempDir::new().expect("tempdir");
    let writer = PersistentCache::open(&CacheConfig::at(dir.path()));
    let reader = PersistentCache::open(&CacheConfig::at(dir.path()));

    writer.store(&key("100000001"), &vec![1_u64, 2, 3], Duration::from_secs(60));
    assert_eq!(reader.lookup::<Vec<u64>>(&key("100000001")), Some(vec![1, 2, 3]));
    assert_eq!(reader.stats().hits, 1);
    assert_eq!(writer.stats().writes, 1);
}

#[test]
fn expiry_is_measured_against_the_clock() {
    let dir = TempDir::new().expect("tempdir");
    let clock = ManualClock::starting_at(START_MS);
    let cache = cache_with_clock(&dir, &clock);
    let calls = AtomicUsize::new(0);
    let compute = || -> Result<u32, ()> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    };

    let ttl = Duration::from_secs(3600);
    assert_eq!(cache.get_or_compute(&key("100000001"), ttl, compute), Ok(7));
    clock.advance_secs(3599);
    assert_eq!(cache.get_or_compute(&key("100000001"), ttl, compute), Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance_secs(1);
    assert_eq!(cache.get_or_compute(&key("100000001"), ttl, compute), Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn namespaces_never_share_entries() {
    let dir = TempDir::new().expect("tempdir");
    let cache = PersistentCache::open(&CacheConfig::at(dir.path()));
    let ga4 = CacheKeyBuilder::new(CacheNamespace::GA4_REPORT).arg("example.com").build();
    let gsc = CacheKeyBuilder::new(CacheNamespace::GSC_REPORT).arg("example.com").build();
    assert_ne!(ga4, gsc);

    cache.store(&ga4, "ga4", Duration::from_secs(60));
    assert_eq!(cache.lookup::<String>(&gsc), None);
    assert_eq!(cache.invalidate(&InvalidateScope::Namespace(CacheNamespace::GSC_REPORT)), 0);
    assert_eq!(cache.lookup::<String>(&ga4).as_deref(), Some("ga4"));
}

#[test]
fn threads_share_one_cache_safely() {
    let dir = TempDir::new().expect("tempdir");
    let cache = PersistentCache::open(&CacheConfig::at(dir.path()));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let cache = cache.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    let key = key(&format!("10000000{}", (worker + round) % 4));
                    let value: Result<String, ()> =
                        cache.get_or_compute(&key, Duration::from_secs(60), || Ok(format!("rows-{}", (worker + round) % 4)));
                    assert!(value.is_ok());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    for id in 0..4 {
        assert_eq!(
            cache.lookup::<String>(&key(&format!("10000000{id}"))),
            Some(format!("rows-{id}"))
        );
    }
    assert!(cache.health_check().overall_healthy);
}

#[test]
fn repair_cleans_up_after_a_damaged_directory() {
    let dir = TempDir::new().expect("tempdir");
    let clock = ManualClock::starting_at(START_MS);
    let cache = cache_with_clock(&dir, &clock);
    cache.store(&key("100000001"), &1, Duration::from_secs(10));
    cache.store(&key("200000002"), &2, Duration::from_secs(1000));

    let victim = dir
        .path()
        .join("ga4_report")
        .join(format!("{}.json", key("200000002").digest()));
    fs::write(&victim, b"{ not json").expect("corrupt entry");
    clock.advance_secs(60);

    let health = cache.health_check();
    assert!(!health.overall_healthy);
    assert_eq!(health.corrupted_entries, 1);
    assert_eq!(health.expired_entries, 1);

    let report = cache.repair();
    assert_eq!(report.expired_removed, 1);
    assert_eq!(report.corrupted_removed, 1);
    assert!(cache.health_check().overall_healthy);
}

#[test]
fn discovery_cache_evicts_least_recently_used_account() {
    let clock = ManualClock::starting_at(START_MS);
    let discovery = DiscoveryCache::with_clock(
        std::num::NonZeroUsize::new(2).expect("non-zero"),
        Duration::from_secs(60),
        Arc::new(clock),
    );
    discovery.put("a", vec!["100000001".into()], None);
    discovery.put("b", vec!["200000002".into()], None);
    assert!(discovery.get("a").is_some());
    discovery.put("c", vec!["300000003".into()], None);

    assert_eq!(discovery.len(), 2);
    assert!(discovery.get("b").is_none());
    assert!(discovery.get("a").is_some());
    assert_eq!(discovery.stats().evictions, 1);
}
