//! Cache key definitions.
//!
//! A key is `namespace:sha256(canonical arguments)`. The namespace is
//! assigned when a fetch function is registered and is never derived from
//! its arguments, so two fetchers with identical argument tuples cannot
//! collide.
//!
//! Argument policy:
//! - positional and keyword list values keep their order (dimension and
//!   metric order is meaningful to the upstream reports);
//! - mapping values are canonicalised by sorted keys at every depth;
//! - keyword arguments are sorted by name;
//! - [`CacheKeyBuilder::unordered_arg`] opts a single argument into set
//!   semantics (sorted and deduplicated).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Namespace isolating one logical fetch function's keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheNamespace(Cow<'static, str>);

impl CacheNamespace {
    /// GA4 report fetches.
    pub const GA4_REPORT: Self = Self::new("ga4_report");
    /// Search Console report fetches.
    pub const GSC_REPORT: Self = Self::new("gsc_report");
    /// Search Console report fetches issued from the async path. Kept apart
    /// from [`Self::GSC_REPORT`] because the async client returns rows in a
    /// different shape for the same arguments.
    pub const GSC_REPORT_ASYNC: Self = Self::new("gsc_report_async");
    /// Synthetic entries written by health checks.
    pub const HEALTH_PROBE: Self = Self::new("health_probe");

    /// Namespaces registered by this crate.
    pub const REGISTERED: [Self; 4] = [
        Self::GA4_REPORT,
        Self::GSC_REPORT,
        Self::GSC_REPORT_ASYNC,
        Self::HEALTH_PROBE,
    ];

    /// Register a namespace. Names must be lowercase ASCII, digits or `_`.
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Parse a namespace name supplied at runtime (CLI, HTTP, directory scan).
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        if is_valid_namespace(trimmed) {
            Some(Self(Cow::Owned(trimmed.to_string())))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn is_valid_namespace(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Fully computed cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    namespace: CacheNamespace,
    digest: String,
}

impl CacheKey {
    pub(crate) fn from_parts(namespace: CacheNamespace, digest: impl Into<String>) -> Self {
        Self {
            namespace,
            digest: digest.into(),
        }
    }

    pub fn namespace(&self) -> &CacheNamespace {
        &self.namespace
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.digest)
    }
}

/// Incrementally collects a fetch call's logical arguments.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: CacheNamespace,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl CacheKeyBuilder {
    pub fn new(namespace: CacheNamespace) -> Self {
        Self {
            namespace,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg<T>(mut self, value: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        self.args.push(to_canonical(value));
        self
    }

    /// Append a positional argument whose element order carries no meaning.
    pub fn unordered_arg<I, T>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Serialize + fmt::Debug,
    {
        self.args.push(unordered(values));
        self
    }

    /// Set a keyword argument. Setting the same name twice keeps the last value.
    pub fn kwarg<T>(mut self, name: &str, value: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        self.kwargs.insert(name.to_string(), to_canonical(value));
        self
    }

    /// Keyword counterpart of [`CacheKeyBuilder::unordered_arg`].
    pub fn unordered_kwarg<I, T>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Serialize + fmt::Debug,
    {
        self.kwargs.insert(name.to_string(), unordered(values));
        self
    }

    pub fn build(self) -> CacheKey {
        encode(&self.namespace, &self.args, &self.kwargs)
    }
}

/// Encode already-serialised arguments into a key. Never fails.
pub fn encode(
    namespace: &CacheNamespace,
    args: &[Value],
    kwargs: &BTreeMap<String, Value>,
) -> CacheKey {
    let args: Vec<Value> = args.iter().cloned().map(canonicalize).collect();
    let kwargs: Map<String, Value> = kwargs
        .iter()
        .map(|(name, value)| (name.clone(), canonicalize(value.clone())))
        .collect();
    let payload = json!({ "args": args, "kwargs": kwargs });

    let bytes = serde_json::to_vec(&payload).unwrap_or_else(|_| format!("{payload:?}").into_bytes());
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(&bytes);
    CacheKey::from_parts(namespace.clone(), hex::encode(hasher.finalize()))
}

/// Serialise a value, falling back to its `Debug` form when serde refuses it.
fn to_canonical<T>(value: &T) -> Value
where
    T: Serialize + fmt::Debug + ?Sized,
{
    match serde_json::to_value(value) {
        Ok(value) => canonicalize(value),
        Err(_) => json!({ "$repr": format!("{value:?}") }),
    }
}

fn unordered<I, T>(values: I) -> Value
where
    I: IntoIterator<Item = T>,
    T: Serialize + fmt::Debug,
{
    let mut items: Vec<(String, Value)> = values
        .into_iter()
        .map(|item| {
            let value = to_canonical(&item);
            (value.to_string(), value)
        })
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));
    items.dedup_by(|a, b| a.0 == b.0);
    Value::Array(items.into_iter().map(|(_, value)| value).collect())
}

/// Rebuild objects with sorted keys so map ordering never leaks into a key.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
