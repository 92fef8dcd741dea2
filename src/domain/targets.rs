//! Query targets: GA4 property IDs and Search Console domains.
//!
//! Inputs arrive as a single string, a comma-separated string, or a list.
//! [`parse`] flattens all three into one ordered list; [`validate`] splits it
//! into valid and invalid entries without ever failing.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

const PROPERTY_ID_MIN_DIGITS: usize = 9;
const PROPERTY_ID_MAX_DIGITS: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_HOST_LEN: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    PropertyId,
    Domain,
}

impl TargetKind {
    /// Column naming the source target on each output row.
    pub fn attribution_field(self) -> &'static str {
        match self {
            Self::PropertyId => "property_id",
            Self::Domain => "domain",
        }
    }

    /// Plural used in summary field names (`properties_queried`, ...).
    pub fn plural(self) -> &'static str {
        match self {
            Self::PropertyId => "properties",
            Self::Domain => "domains",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PropertyId => "property-id",
            Self::Domain => "domain",
        }
    }

    pub fn is_valid(self, value: &str) -> bool {
        match self {
            Self::PropertyId => is_property_id(value),
            Self::Domain => is_domain(value),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "property-id" | "property_id" | "property" | "ga4" => Ok(Self::PropertyId),
            "domain" | "site" | "gsc" => Ok(Self::Domain),
            other => Err(ValidationError::unknown("target kind", other)),
        }
    }
}

/// One validated target. `id` keeps the caller's spelling for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub kind: TargetKind,
    pub id: String,
}

impl Target {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Identity used for deduplication and matching.
    pub fn comparison_key(&self) -> String {
        match self.kind {
            TargetKind::PropertyId => self.id.clone(),
            TargetKind::Domain => normalize_domain(&self.id),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Raw target parameter as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetInput {
    One(String),
    Many(Vec<String>),
}

impl TargetInput {
    pub fn values(&self) -> Vec<String> {
        match self {
            Self::One(value) => value
                .split(',')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
            Self::Many(values) => values
                .iter()
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl From<&str> for TargetInput {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<Vec<String>> for TargetInput {
    fn from(values: Vec<String>) -> Self {
        Self::Many(values)
    }
}

impl From<Vec<&str>> for TargetInput {
    fn from(values: Vec<&str>) -> Self {
        Self::Many(values.into_iter().map(str::to_string).collect())
    }
}

/// Flatten a target parameter into an ordered list. Duplicates are kept.
pub fn parse(input: Option<&TargetInput>) -> Vec<String> {
    input.map(TargetInput::values).unwrap_or_default()
}

/// Split `values` into `(valid, invalid)`, preserving order in both.
pub fn validate(values: &[String], kind: TargetKind) -> (Vec<String>, Vec<String>) {
    values
        .iter()
        .map(|value| value.trim().to_string())
        .partition(|value| kind.is_valid(value))
}

/// Wrap validated ids, dropping later aliases of an earlier target.
pub fn into_targets(valid: Vec<String>, kind: TargetKind) -> Vec<Target> {
    dedupe(valid.into_iter().map(|id| Target::new(kind, id)).collect())
}

/// Keep the first spelling of every target identity.
pub fn dedupe(targets: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| seen.insert(target.comparison_key()))
        .collect()
}

pub fn ensure_batch_size(count: usize, max: usize, kind: TargetKind) -> Result<(), ValidationError> {
    if count > max {
        return Err(ValidationError::BatchTooLarge {
            kind: kind.plural(),
            count,
            max,
        });
    }
    Ok(())
}

fn is_property_id(value: &str) -> bool {
    (PROPERTY_ID_MIN_DIGITS..=PROPERTY_ID_MAX_DIGITS).contains(&value.len())
        && value.bytes().all(|b| b.is_ascii_digit())
}

fn is_domain(value: &str) -> bool {
    let host = host_of(value);
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| is_label(label))
}

fn is_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= MAX_LABEL_LEN
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}

/// Lowercased host with `sc-domain:`, scheme, path, query, port and the
/// trailing root dot removed. `www.` is kept.
fn host_of(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut rest = lowered.as_str();
    rest = rest.strip_prefix("sc-domain:").unwrap_or(rest);
    for scheme in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    rest = &rest[..end];
    if let Some((host, port)) = rest.rsplit_once(':')
        && !port.is_empty()
        && port.bytes().all(|b| b.is_ascii_digit())
    {
        rest = host;
    }
    rest.trim_end_matches('.').to_string()
}

/// Canonical host for equality: [`host_of`] plus a leading `www.` removed.
/// `blog.example.com` and `example.com` stay distinct.
pub fn normalize_domain(raw: &str) -> String {
    let host = host_of(raw);
    if let Some(bare) = host.strip_prefix("www.")
        && !bare.is_empty()
    {
        return bare.to_string();
    }
    host
}

/// Search Console sites that serve one requested domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteMatch {
    pub domain: Target,
    pub sites: Vec<String>,
}

impl SiteMatch {
    /// Sites to query for this domain. Falls back to the requested spelling
    /// when nothing listed matches it.
    pub fn into_sites(self) -> Vec<Target> {
        let kind = self.domain.kind;
        let mut seen = HashSet::new();
        let sites: Vec<Target> = self
            .sites
            .into_iter()
            .filter(|site| seen.insert(site.clone()))
            .map(|site| Target::new(kind, site))
            .collect();
        if sites.is_empty() { vec![self.domain] } else { sites }
    }
}

/// For each requested domain, the discovered site URLs (`sc-domain:` or URL
/// prefix properties) whose normalised host equals the domain's.
pub fn match_sites(requested: &[Target], sites: &[String]) -> Vec<SiteMatch> {
    let normalised: Vec<(String, &String)> = sites
        .iter()
        .map(|site| (normalize_domain(site), site))
        .collect();
    requested
        .iter()
        .map(|domain| {
            let wanted = domain.comparison_key();
            SiteMatch {
                domain: domain.clone(),
                sites: normalised
                    .iter()
                    .filter(|(host, _)| *host == wanted)
                    .map(|(_, site)| (*site).clone())
                    .collect(),
            }
        })
        .collect()
}
