//! Health and statistics for both caches, combined for the status surface.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::cache::{
    CacheNamespace, CacheStats, DiscoveryCache, DiscoveryHealth, DiscoveryStats, HealthReport,
    InvalidateScope, PersistentCache, RepairReport,
};
use crate::domain::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub persistent: CacheStats,
    pub discovery: DiscoveryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusHealth {
    pub overall_healthy: bool,
    pub persistent: HealthReport,
    pub discovery: DiscoveryHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub persistent_removed: usize,
    pub discovery_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub persistent: RepairReport,
    pub discovery_expired_removed: usize,
}

#[derive(Debug, Clone)]
pub struct StatusService {
    cache: PersistentCache,
    discovery: Arc<DiscoveryCache>,
}

impl StatusService {
    pub fn new(cache: PersistentCache, discovery: Arc<DiscoveryCache>) -> Self {
        Self { cache, discovery }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            persistent: self.cache.stats(),
            discovery: self.discovery.stats(),
        }
    }

    /// Reports problems without fixing them; see [`StatusService::repair`].
    pub fn health(&self) -> StatusHealth {
        let persistent = self.cache.health_check();
        let discovery = self.discovery.health_check();
        StatusHealth {
            overall_healthy: persistent.overall_healthy && discovery.overall_healthy,
            persistent,
            discovery,
        }
    }

    /// Clear one persistent namespace, or everything (discovery included)
    /// when `namespace` is `None`.
    pub fn clear(&self, namespace: Option<&str>) -> Result<ClearReport, ValidationError> {
        let report = match namespace.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => {
                let namespace =
                    CacheNamespace::parse(name).ok_or_else(|| ValidationError::unknown("cache namespace", name))?;
                ClearReport {
                    persistent_removed: self.cache.invalidate(&InvalidateScope::Namespace(namespace)),
                    discovery_removed: 0,
                }
            }
            None => ClearReport {
                persistent_removed: self.cache.invalidate(&InvalidateScope::All),
                discovery_removed: self.discovery.invalidate(None),
            },
        };
        info!(
            target = "analytics_relay::application::status",
            op = "clear",
            namespace = namespace.unwrap_or("*"),
            persistent_removed = report.persistent_removed,
            discovery_removed = report.discovery_removed,
            "Cache cleared"
        );
        Ok(report)
    }

    pub fn repair(&self) -> RepairSummary {
        RepairSummary {
            persistent: self.cache.repair(),
            discovery_expired_removed: self.discovery.purge_expired(),
        }
    }
}
