//! Caching for report fetches and account discovery.
//!
//! - **Persistent cache**: disk-backed TTL memoisation of per-target report
//!   fetches, keyed by namespace plus a canonical digest of the arguments.
//! - **Discovery cache**: bounded in-memory LRU of per-account target lists.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! directory = "/var/cache/analytics-relay"
//! query_ttl_seconds = 3600
//! size_limit_bytes = 524288000
//! discovery_ttl_seconds = 86400
//! discovery_max_entries = 100
//! ```

mod clock;
mod config;
mod discovery;
mod disk;
mod error;
mod health;
mod keys;
mod lock;
mod persistent;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, default_directory};
pub use discovery::DiscoveryCache;
pub use disk::{CacheStore, EntryMeta, EntryState, FsStore, StoredEntry};
pub use error::CacheFault;
pub use health::{CacheStats, DiscoveryHealth, DiscoveryStats, HealthReport, RepairReport};
pub use keys::{CacheKey, CacheKeyBuilder, CacheNamespace, encode};
pub use persistent::{InvalidateScope, PersistentCache};
