//! Cache configuration.
//!
//! Controls the on-disk query cache and the in-memory discovery cache via the
//! `[cache]` table of `analytics-relay.toml`.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub(crate) const DEFAULT_CACHE_DIR_NAME: &str = ".ga_gsc_cache";
pub(crate) const DEFAULT_QUERY_TTL_SECS: u64 = 3600;
pub(crate) const DEFAULT_SIZE_LIMIT_BYTES: u64 = 500 * 1024 * 1024;
pub(crate) const DEFAULT_DISCOVERY_TTL_SECS: u64 = 86_400;
pub(crate) const DEFAULT_DISCOVERY_MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to bypass the query cache entirely; every call computes.
    pub enabled: bool,
    /// Root directory of the on-disk query cache.
    pub directory: PathBuf,
    /// Default lifetime of memoised query results.
    pub query_ttl_seconds: u64,
    /// Upper bound on stored bytes before culling kicks in.
    pub size_limit_bytes: u64,
    /// Default lifetime of discovery lists.
    pub discovery_ttl_seconds: u64,
    /// Maximum number of accounts held by the discovery cache.
    pub discovery_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_directory(),
            query_ttl_seconds: DEFAULT_QUERY_TTL_SECS,
            size_limit_bytes: DEFAULT_SIZE_LIMIT_BYTES,
            discovery_ttl_seconds: DEFAULT_DISCOVERY_TTL_SECS,
            discovery_max_entries: DEFAULT_DISCOVERY_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            directory: settings.directory.clone(),
            query_ttl_seconds: settings.query_ttl.as_secs(),
            size_limit_bytes: settings.size_limit_bytes.get(),
            discovery_ttl_seconds: settings.discovery_ttl.as_secs(),
            discovery_max_entries: settings.discovery_max_entries.get(),
        }
    }
}

impl CacheConfig {
    /// Config rooted at `directory` with every other value defaulted.
    pub fn at(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn query_ttl(&self) -> Duration {
        Duration::from_secs(self.query_ttl_seconds)
    }

    pub fn discovery_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_ttl_seconds)
    }

    /// Returns the discovery cap as NonZeroUsize, clamping to 1 if zero.
    pub fn discovery_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.discovery_max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

/// `$HOME/.ga_gsc_cache`, or a relative `.ga_gsc_cache` when no home is set.
pub fn default_directory() -> PathBuf {
    match std::env::var_os("HOME").filter(|home| !home.is_empty()) {
        Some(home) => PathBuf::from(home).join(DEFAULT_CACHE_DIR_NAME),
        None => PathBuf::from(DEFAULT_CACHE_DIR_NAME),
    }
}
