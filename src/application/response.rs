//! Shapes fan-out output into the aggregated or grouped response.
//!
//! Field names follow the target kind: a GA4 query reports
//! `properties_queried` and `failed_properties`, a Search Console query
//! `domains_queried` and `failed_domains`. Apart from the optional
//! `generated_at` stamp, the same inputs always serialise to the same bytes.

use std::collections::HashMap;
use std::str::FromStr;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::domain::dates::DateRange;
use crate::domain::error::ValidationError;
use crate::domain::rows::{self, Row};
use crate::domain::targets::{Target, TargetKind};

use super::fanout::{AggregateStatus, FanOutResult, FetchErrorKind, TargetStatus, aggregate_status};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Aggregated,
    Grouped,
}

impl ResponseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregated => "aggregated",
            Self::Grouped => "grouped",
        }
    }
}

impl FromStr for ResponseFormat {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "aggregated" | "flat" => Ok(Self::Aggregated),
            "grouped" => Ok(Self::Grouped),
            other => Err(ValidationError::unknown("response format", other)),
        }
    }
}

/// Batch-level counts and metric sums.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub kind: TargetKind,
    pub total_rows: usize,
    pub queried: usize,
    /// Includes `no_data` targets.
    pub successful: usize,
    pub failed: usize,
    pub no_data: usize,
    pub metric_totals: Map<String, Value>,
}

impl Summary {
    fn compute(kind: TargetKind, results: &[FanOutResult], rows: &[Row]) -> Self {
        let count = |status: TargetStatus| results.iter().filter(|result| result.status == status).count();
        let no_data = count(TargetStatus::NoData);
        Self {
            kind,
            total_rows: rows.len(),
            queried: results.len(),
            successful: count(TargetStatus::Success) + no_data,
            failed: count(TargetStatus::Failed),
            no_data,
            metric_totals: rows::metric_totals(rows),
        }
    }
}

impl Serialize for Summary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let plural = self.kind.plural();
        let mut map = serializer.serialize_map(Some(6))?;
        map.serialize_entry("total_rows", &self.total_rows)?;
        map.serialize_entry(&format!("{plural}_queried"), &self.queried)?;
        map.serialize_entry(&format!("{plural}_successful"), &self.successful)?;
        map.serialize_entry(&format!("{plural}_failed"), &self.failed)?;
        map.serialize_entry(&format!("{plural}_no_data"), &self.no_data)?;
        map.serialize_entry("metric_totals", &self.metric_totals)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTarget {
    pub target: Target,
    pub error: String,
    pub error_kind: FetchErrorKind,
    pub retry_recommended: bool,
}

impl Serialize for FailedTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry(self.target.kind.attribution_field(), &self.target.id)?;
        map.serialize_entry("error", &self.error)?;
        map.serialize_entry("error_kind", &self.error_kind)?;
        map.serialize_entry("retry_recommended", &self.retry_recommended)?;
        map.end()
    }
}

/// One target's slice of a grouped response.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    pub target: Target,
    pub status: TargetStatus,
    pub rows: Vec<Row>,
    pub metric_totals: Map<String, Value>,
    pub error: Option<String>,
}

impl Serialize for TargetGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("row_count", &self.rows.len())?;
        map.serialize_entry("data", &self.rows)?;
        map.serialize_entry("metric_totals", &self.metric_totals)?;
        if let Some(error) = &self.error {
            map.serialize_entry("error", error)?;
        }
        map.end()
    }
}

/// Groups serialise as a map keyed by target id, in submission order.
struct GroupMap<'a>(&'a [TargetGroup]);

impl Serialize for GroupMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for group in self.0 {
            map.serialize_entry(&group.target.id, group)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Aggregated {
        data: Vec<Row>,
        summary: Summary,
    },
    Grouped {
        groups: Vec<TargetGroup>,
        overall_summary: Summary,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub status: AggregateStatus,
    pub message: String,
    pub kind: TargetKind,
    pub row_count: usize,
    pub body: ResponseBody,
    pub failed: Vec<FailedTarget>,
    pub date_range: Option<DateRange>,
    pub source: Option<String>,
    pub generated_at: Option<OffsetDateTime>,
}

impl QueryResponse {
    pub fn format(&self) -> ResponseFormat {
        match self.body {
            ResponseBody::Aggregated { .. } => ResponseFormat::Aggregated,
            ResponseBody::Grouped { .. } => ResponseFormat::Grouped,
        }
    }

    /// `summary` for aggregated output, `overall_summary` for grouped.
    pub fn summary(&self) -> &Summary {
        match &self.body {
            ResponseBody::Aggregated { summary, .. } => summary,
            ResponseBody::Grouped { overall_summary, .. } => overall_summary,
        }
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach the wall-clock stamp. Leave unset for golden comparisons.
    pub fn stamped(mut self, at: OffsetDateTime) -> Self {
        self.generated_at = Some(at);
        self
    }
}

impl Serialize for QueryResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("message", &self.message)?;
        map.serialize_entry("format", &self.format())?;
        if let Some(range) = &self.date_range {
            map.serialize_entry("date_range", range)?;
        }
        if let Some(source) = &self.source {
            map.serialize_entry("source", source)?;
        }
        map.serialize_entry("row_count", &self.row_count)?;
        match &self.body {
            ResponseBody::Aggregated { data, summary } => {
                map.serialize_entry("data", data)?;
                map.serialize_entry("summary", summary)?;
            }
            ResponseBody::Grouped {
                groups,
                overall_summary,
            } => {
                map.serialize_entry("results", &GroupMap(groups))?;
                map.serialize_entry("overall_summary", overall_summary)?;
            }
        }
        map.serialize_entry(&format!("failed_{}", self.kind.plural()), &self.failed)?;
        if let Some(at) = self.generated_at {
            let stamp = at.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
            map.serialize_entry("generated_at", &stamp)?;
        }
        map.end()
    }
}

/// Build the response for one fan-out. `combined_rows` must carry the
/// attribution column written by the orchestrator.
pub fn assemble(
    kind: TargetKind,
    results: &[FanOutResult],
    combined_rows: &[Row],
    format: ResponseFormat,
) -> QueryResponse {
    let status = aggregate_status(results);
    let summary = Summary::compute(kind, results, combined_rows);
    let failed: Vec<FailedTarget> = results
        .iter()
        .filter(|result| result.status == TargetStatus::Failed)
        .map(|result| FailedTarget {
            target: result.target.clone(),
            error: result.error.clone().unwrap_or_default(),
            error_kind: result.error_kind.unwrap_or(FetchErrorKind::Other),
            retry_recommended: result.retry_recommended.unwrap_or(true),
        })
        .collect();
    let message = describe(kind, status, &summary, &failed);

    let body = match format {
        ResponseFormat::Aggregated => ResponseBody::Aggregated {
            data: combined_rows.to_vec(),
            summary,
        },
        ResponseFormat::Grouped => ResponseBody::Grouped {
            groups: group_rows(kind, results, combined_rows),
            overall_summary: summary,
        },
    };

    QueryResponse {
        status,
        message,
        kind,
        row_count: combined_rows.len(),
        body,
        failed,
        date_range: None,
        source: None,
        generated_at: None,
    }
}

fn group_rows(kind: TargetKind, results: &[FanOutResult], combined_rows: &[Row]) -> Vec<TargetGroup> {
    let field = kind.attribution_field();
    let mut by_target: HashMap<&str, Vec<Row>> = HashMap::new();
    for row in combined_rows {
        if let Some(Value::String(id)) = row.get(field) {
            by_target.entry(id.as_str()).or_default().push(row.clone());
        }
    }

    results
        .iter()
        .map(|result| {
            let rows = by_target.remove(result.target.id.as_str()).unwrap_or_default();
            TargetGroup {
                target: result.target.clone(),
                status: result.status,
                metric_totals: rows::metric_totals(&rows),
                rows,
                error: result.error.clone(),
            }
        })
        .collect()
}

fn describe(kind: TargetKind, status: AggregateStatus, summary: &Summary, failed: &[FailedTarget]) -> String {
    let plural = kind.plural();
    let failures = || {
        failed
            .iter()
            .map(|failure| format!("{}: {}", failure.target.id, failure.error))
            .collect::<Vec<_>>()
            .join("; ")
    };
    match status {
        AggregateStatus::Success => format!(
            "Retrieved {} rows from {} {plural}",
            summary.total_rows, summary.queried
        ),
        AggregateStatus::PartialSuccess => format!(
            "Retrieved {} rows from {} of {} {plural}; {} failed ({})",
            summary.total_rows,
            summary.successful,
            summary.queried,
            summary.failed,
            failures()
        ),
        AggregateStatus::Error if summary.queried == 0 => format!("No {plural} to query"),
        AggregateStatus::Error => format!("All {} {plural} failed ({})", summary.failed, failures()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::application::fanout::{FanOut, FetchError};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn result(id: &str, status: TargetStatus, rows: usize, error: Option<FetchError>) -> FanOutResult {
        FanOutResult {
            target: Target::new(TargetKind::PropertyId, id),
            status,
            rows_contributed: rows,
            retry_recommended: error.as_ref().map(FetchError::retry_recommended),
            error_kind: error.as_ref().map(|error| error.kind),
            error: error.map(|error| error.message),
        }
    }

    fn fixture() -> (Vec<FanOutResult>, Vec<Row>) {
        let results = vec![
            result("100000001", TargetStatus::Success, 2, None),
            result("200000002", TargetStatus::NoData, 0, None),
            result(
                "300000003",
                TargetStatus::Failed,
                0,
                Some(FetchError::transient("Quota exceeded")),
            ),
        ];
        let rows = vec![
            row(json!({"property_id": "100000001", "pagePath": "/", "screenPageViews": 10})),
            row(json!({"property_id": "100000001", "pagePath": "/b", "screenPageViews": 5})),
        ];
        (results, rows)
    }

    #[test]
    fn aggregated_shape_names_fields_after_the_kind() {
        let (results, rows) = fixture();
        let response = assemble(TargetKind::PropertyId, &results, &rows, ResponseFormat::Aggregated);
        let json = serde_json::to_value(&response).expect("serialise");

        assert_eq!(json["status"], json!("partial_success"));
        assert_eq!(json["format"], json!("aggregated"));
        assert_eq!(json["row_count"], json!(2));
        assert_eq!(json["data"].as_array().map(Vec::len), Some(2));
        assert_eq!(
            json["summary"],
            json!({
                "total_rows": 2,
                "properties_queried": 3,
                "properties_successful": 2,
                "properties_failed": 1,
                "properties_no_data": 1,
                "metric_totals": {"screenPageViews": 15}
            })
        );
        assert_eq!(
            json["failed_properties"],
            json!([{
                "property_id": "300000003",
                "error": "Quota exceeded",
                "error_kind": "transient",
                "retry_recommended": true
            }])
        );
        assert!(json.get("generated_at").is_none());
        assert!(response.message.contains("300000003: Quota exceeded"));
    }

    #[test]
    fn grouped_shape_keeps_submission_order_and_per_target_totals() {
        let (results, rows) = fixture();
        let response = assemble(TargetKind::PropertyId, &results, &rows, ResponseFormat::Grouped);
        let text = serde_json::to_string(&response).expect("serialise");
        let first = text.find("\"100000001\"").expect("first group");
        let second = text.find("\"200000002\"").expect("second group");
        let third = text.find("\"300000003\":{").expect("third group");
        assert!(first < second && second < third);

        let json: Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(json["results"]["100000001"]["row_count"], json!(2));
        assert_eq!(
            json["results"]["100000001"]["metric_totals"],
            json!({"screenPageViews": 15})
        );
        assert_eq!(json["results"]["200000002"]["status"], json!("no_data"));
        assert_eq!(json["results"]["300000003"]["error"], json!("Quota exceeded"));
        assert_eq!(json["overall_summary"]["properties_failed"], json!(1));
        assert_eq!(json["failed_properties"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn both_formats_report_identical_totals() {
        let (results, rows) = fixture();
        let aggregated = assemble(TargetKind::PropertyId, &results, &rows, ResponseFormat::Aggregated);
        let grouped = assemble(TargetKind::PropertyId, &results, &rows, ResponseFormat::Grouped);
        assert_eq!(aggregated.summary(), grouped.summary());
        assert_eq!(aggregated.row_count, grouped.row_count);
        assert_eq!(aggregated.failed, grouped.failed);
    }

    #[test]
    fn output_is_byte_reproducible_without_stamp() {
        let (results, rows) = fixture();
        let first = serde_json::to_vec(&assemble(TargetKind::PropertyId, &results, &rows, ResponseFormat::Grouped))
            .expect("first");
        let second = serde_json::to_vec(&assemble(TargetKind::PropertyId, &results, &rows, ResponseFormat::Grouped))
            .expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn stamp_and_context_are_serialised_when_present() {
        let range = DateRange::parse("2024-01-01", "2024-01-31").expect("range");
        let response = assemble(TargetKind::Domain, &[], &[], ResponseFormat::Aggregated)
            .with_date_range(range)
            .with_source("gsc")
            .stamped(datetime!(2024-02-01 12:00 UTC));
        let json = serde_json::to_value(&response).expect("serialise");

        assert_eq!(json["status"], json!("error"));
        assert_eq!(json["message"], json!("No domains to query"));
        assert_eq!(json["generated_at"], json!("2024-02-01T12:00:00Z"));
        assert_eq!(json["date_range"]["start_date"], json!("2024-01-01"));
        assert_eq!(json["source"], json!("gsc"));
        assert_eq!(json["failed_domains"], json!([]));
    }

    #[test]
    fn total_failure_names_every_target() {
        let results = vec![
            result("100000001", TargetStatus::Failed, 0, Some(FetchError::access("forbidden"))),
            result("200000002", TargetStatus::Failed, 0, Some(FetchError::other("boom"))),
        ];
        let response = assemble(TargetKind::PropertyId, &results, &[], ResponseFormat::Aggregated);
        assert_eq!(response.status, AggregateStatus::Error);
        assert_eq!(
            response.message,
            "All 2 properties failed (100000001: forbidden; 200000002: boom)"
        );
    }

    #[tokio::test]
    async fn assembles_directly_from_a_fan_out_report() {
        let targets = vec![
            Target::new(TargetKind::Domain, "example.com"),
            Target::new(TargetKind::Domain, "example.org"),
        ];
        let report = FanOut::new(std::num::NonZeroUsize::MIN)
            .run(&targets, |target| async move {
                Ok(vec![row(json!({"page": format!("https://{}/", target.id), "clicks": 3}))])
            })
            .await;
        let response = assemble(
            TargetKind::Domain,
            &report.results,
            &report.combined_rows,
            ResponseFormat::Grouped,
        );
        let json = serde_json::to_value(&response).expect("serialise");
        assert_eq!(json["results"]["example.org"]["data"][0]["domain"], json!("example.org"));
        assert_eq!(json["overall_summary"]["metric_totals"]["clicks"], json!(6));
    }
}
