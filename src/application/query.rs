//! The multi-target query pipeline.
//!
//! parse → validate → (discover) → cached fan-out → assemble. Validation
//! failures stop the request before anything is fetched; per-target failures
//! land in the response. A Search Console domain is fetched once per listed
//! site variant and reported under the requested spelling.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheKeyBuilder, CacheNamespace, DiscoveryCache, PersistentCache};
use crate::config::QuerySettings;
use crate::domain::dates::{self, DateRange};
use crate::domain::error::ValidationError;
use crate::domain::rows::{self, Row};
use crate::domain::targets::{self, Target, TargetInput, TargetKind};

use super::fanout::{FanOut, FetchError};
use super::response::{QueryResponse, ResponseFormat, assemble};

/// Column naming the Search Console site a domain row was fetched from.
pub const SITE_FIELD: &str = "site_url";

/// Per-target report fetcher supplied by a GA4 or Search Console client.
/// Calls must be idempotent; results are memoised under `namespace()`.
#[async_trait]
pub trait ReportSource: Send + Sync {
    fn kind(&self) -> TargetKind;

    fn namespace(&self) -> CacheNamespace;

    /// Short label reported as the response `source`.
    fn label(&self) -> &'static str {
        match self.kind() {
            TargetKind::PropertyId => "ga4",
            TargetKind::Domain => "gsc",
        }
    }

    async fn fetch(&self, target: &Target, query: &ReportQuery) -> Result<Vec<Row>, FetchError>;
}

/// Lists the targets an account can see.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn discover(&self, account: &str) -> Result<Vec<String>, FetchError>;
}

/// What to fetch for each target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportQuery {
    pub date_range: DateRange,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub search_type: Option<String>,
    pub filters: BTreeMap<String, Value>,
}

impl ReportQuery {
    pub fn new(date_range: DateRange) -> Self {
        Self {
            date_range,
            dimensions: Vec::new(),
            metrics: Vec::new(),
            search_type: None,
            filters: BTreeMap::new(),
        }
    }

    /// Dimension and metric order is kept; filters are keyed by name.
    pub fn cache_key(&self, namespace: CacheNamespace, target: &Target) -> CacheKey {
        CacheKeyBuilder::new(namespace)
            .arg(target.id.as_str())
            .kwarg("start_date", &self.date_range.start_str())
            .kwarg("end_date", &self.date_range.end_str())
            .kwarg("dimensions", &self.dimensions)
            .kwarg("metrics", &self.metrics)
            .kwarg("search_type", &self.search_type)
            .kwarg("filters", &self.filters)
            .build()
    }
}

/// A caller's request as it arrives from the tool or HTTP boundary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub targets: Option<TargetInput>,
    /// Used for discovery when `targets` is empty.
    pub account: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub search_type: Option<String>,
    pub filters: BTreeMap<String, Value>,
    pub format: ResponseFormat,
    pub use_cache: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            targets: None,
            account: None,
            start_date: None,
            end_date: None,
            dimensions: Vec::new(),
            metrics: Vec::new(),
            search_type: None,
            filters: BTreeMap::new(),
            format: ResponseFormat::default(),
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Caps distinct valid caller-supplied targets; discovered lists are not capped.
    pub max_batch_size: NonZeroUsize,
    pub concurrency_limit: NonZeroUsize,
    pub target_timeout: Option<Duration>,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_batch_size: NonZeroUsize::new(20).unwrap_or(NonZeroUsize::MIN),
            concurrency_limit: NonZeroUsize::new(3).unwrap_or(NonZeroUsize::MIN),
            target_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl From<&QuerySettings> for QueryLimits {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size,
            concurrency_limit: settings.concurrency_limit,
            target_timeout: Some(settings.target_timeout),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("target discovery failed: {0}")]
    Discovery(FetchError),
}

/// The assembled response plus the identifiers rejected by validation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub response: QueryResponse,
    pub invalid_targets: Vec<String>,
}

impl Serialize for QueryOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut value = serde_json::to_value(&self.response).map_err(S::Error::custom)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                format!("invalid_{}s", self.response.kind.attribution_field()),
                Value::from(self.invalid_targets.clone()),
            );
        }
        value.serialize(serializer)
    }
}

pub struct QueryService {
    source: Arc<dyn ReportSource>,
    directory: Option<Arc<dyn TargetDirectory>>,
    cache: PersistentCache,
    discovery: Arc<DiscoveryCache>,
    limits: QueryLimits,
}

impl QueryService {
    pub fn new(
        source: Arc<dyn ReportSource>,
        cache: PersistentCache,
        discovery: Arc<DiscoveryCache>,
        limits: QueryLimits,
    ) -> Self {
        Self {
            source,
            directory: None,
            cache,
            discovery,
            limits,
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn TargetDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    pub async fn execute(&self, request: QueryRequest) -> Result<QueryOutcome, QueryError> {
        let kind = self.source.kind();
        let date_range = DateRange::resolve(
            request.start_date.as_deref(),
            request.end_date.as_deref(),
            dates::today_utc(),
        )?;

        let supplied = targets::parse(request.targets.as_ref());
        let (targets, invalid, listed) = if supplied.is_empty() {
            let discovered = self.discover(request.account.as_deref(), request.use_cache).await?;
            let (valid, dropped) = targets::validate(&discovered, kind);
            if !dropped.is_empty() {
                debug!(
                    target = "analytics_relay::application::query",
                    op = "discover",
                    dropped = dropped.len(),
                    "Discarded malformed discovered targets"
                );
            }
            (targets::into_targets(valid.clone(), kind), Vec::new(), Some(valid))
        } else {
            let (valid, invalid) = targets::validate(&supplied, kind);
            if valid.is_empty() {
                return Err(ValidationError::NoValidTargets {
                    kind: kind.plural(),
                    invalid,
                }
                .into());
            }
            let targets = targets::into_targets(valid, kind);
            targets::ensure_batch_size(targets.len(), self.limits.max_batch_size.get(), kind)?;
            let listed = match request.account.as_deref() {
                Some(account)
                    if kind == TargetKind::Domain && self.directory.is_some() && !account.trim().is_empty() =>
                {
                    Some(self.discover(Some(account), request.use_cache).await?)
                }
                _ => None,
            };
            (targets, invalid, listed)
        };
        let sites = site_plan(kind, &targets, listed.as_deref());

        let query = ReportQuery {
            date_range,
            dimensions: request.dimensions,
            metrics: request.metrics,
            search_type: request.search_type,
            filters: request.filters,
        };
        info!(
            target = "analytics_relay::application::query",
            op = "execute",
            source = self.source.label(),
            targets = targets.len(),
            invalid = invalid.len(),
            start_date = %date_range.start_str(),
            end_date = %date_range.end_str(),
            use_cache = request.use_cache,
            "Running multi-target query"
        );

        let mut fanout = FanOut::new(self.limits.concurrency_limit);
        if let Some(limit) = self.limits.target_timeout {
            fanout = fanout.with_timeout(limit);
        }
        let use_cache = request.use_cache;
        let query = &query;
        let sites = &sites;
        let report = fanout
            .run(&targets, |target| async move {
                match sites.get(&target.id) {
                    Some(sites) => self.fetch_sites(&target, sites, query, use_cache).await,
                    None => self.fetch_one(&target, query, use_cache).await,
                }
            })
            .await;

        let response = assemble(kind, &report.results, &report.combined_rows, request.format)
            .with_date_range(date_range)
            .with_source(self.source.label())
            .stamped(OffsetDateTime::now_utc());
        Ok(QueryOutcome {
            response,
            invalid_targets: invalid,
        })
    }

    async fn fetch_one(&self, target: &Target, query: &ReportQuery, use_cache: bool) -> Result<Vec<Row>, FetchError> {
        if !use_cache {
            return self.source.fetch(target, query).await;
        }
        let key = query.cache_key(self.source.namespace(), target);
        self.cache
            .get_or_compute_async(&key, self.cache.default_ttl(), || self.source.fetch(target, query))
            .await
    }

    /// Fetch every site variant of one domain. Rows are tagged with the site
    /// they came from; the domain fails only when every variant failed.
    async fn fetch_sites(
        &self,
        domain: &Target,
        sites: &[Target],
        query: &ReportQuery,
        use_cache: bool,
    ) -> Result<Vec<Row>, FetchError> {
        let mut collected = Vec::new();
        let mut fetched = false;
        let mut first_error = None;
        for site in sites {
            match self.fetch_one(site, query, use_cache).await {
                Ok(site_rows) => {
                    fetched = true;
                    collected.extend(site_rows.into_iter().map(|row| rows::attribute(row, SITE_FIELD, &site.id)));
                }
                Err(error) => {
                    warn!(
                        target = "analytics_relay::application::query",
                        op = "fetch_sites",
                        domain = %domain,
                        site = %site,
                        error_kind = error.kind.as_str(),
                        error = %error,
                        "Site variant fetch failed"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) if !fetched => Err(error),
            _ => Ok(collected),
        }
    }

    async fn discover(&self, account: Option<&str>, use_cache: bool) -> Result<Vec<String>, QueryError> {
        let account = account
            .map(str::trim)
            .filter(|account| !account.is_empty())
            .ok_or_else(|| ValidationError::missing_field("targets"))?;
        let Some(directory) = &self.directory else {
            return Err(ValidationError::missing_field("targets").into());
        };
        let scoped = format!("{}:{account}", self.source.kind().as_str());
        self.discovery
            .get_or_discover(&scoped, None, use_cache, || directory.discover(account))
            .await
            .map_err(QueryError::Discovery)
    }
}

/// Domain id → listed sites to query for it. Empty unless a site listing was
/// fetched for a Search Console source.
fn site_plan(kind: TargetKind, targets: &[Target], listed: Option<&[String]>) -> HashMap<String, Vec<Target>> {
    match listed {
        Some(listed) if kind == TargetKind::Domain => targets::match_sites(targets, listed)
            .into_iter()
            .map(|matched| (matched.domain.id.clone(), matched.into_sites()))
            .collect(),
        _ => HashMap::new(),
    }
}
