//! Process-wide state built once from [`Settings`].
//!
//! Every [`QueryService`] handed out shares the same persistent and discovery
//! caches as the [`StatusService`], so the status surface reports what the
//! query paths actually did.

use std::sync::Arc;

use crate::cache::{CacheConfig, DiscoveryCache, PersistentCache};
use crate::config::Settings;

use super::query::{QueryLimits, QueryService, ReportSource};
use super::status::StatusService;

#[derive(Clone)]
pub struct Relay {
    cache: PersistentCache,
    discovery: Arc<DiscoveryCache>,
    status: Arc<StatusService>,
    limits: QueryLimits,
}

impl Relay {
    pub fn from_settings(settings: &Settings) -> Self {
        let cache = PersistentCache::open(&CacheConfig::from(&settings.cache));
        let discovery = Arc::new(DiscoveryCache::from_config(cache.config()));
        let status = Arc::new(StatusService::new(cache.clone(), discovery.clone()));
        Self {
            cache,
            discovery,
            status,
            limits: QueryLimits::from(&settings.query),
        }
    }

    pub fn cache(&self) -> &PersistentCache {
        &self.cache
    }

    pub fn discovery(&self) -> &Arc<DiscoveryCache> {
        &self.discovery
    }

    pub fn status(&self) -> Arc<StatusService> {
        self.status.clone()
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    /// A query pipeline for `source` over the shared caches and the
    /// configured `query.*` limits.
    pub fn query_service(&self, source: Arc<dyn ReportSource>) -> QueryService {
        QueryService::new(source, self.cache.clone(), self.discovery.clone(), self.limits)
    }
}
