use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// The cache operation a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    Stats,
    Health,
    Clear,
    Repair,
    Unknown,
}

impl CacheOperation {
    fn from_path(path: &str) -> Self {
        match path.trim_end_matches('/') {
            "/api/cache/stats" => Self::Stats,
            "/api/cache/health" => Self::Health,
            "/api/cache/clear" => Self::Clear,
            "/api/cache/repair" => Self::Repair,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stats => "cache::stats",
            Self::Health => "cache::health",
            Self::Clear => "cache::clear",
            Self::Repair => "cache::repair",
            Self::Unknown => "unknown",
        }
    }

    /// Operations that remove cache entries.
    fn removes_entries(self) -> bool {
        matches!(self, Self::Clear | Self::Repair)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub operation: CacheOperation,
    /// Raw `namespace` query parameter, if any.
    pub namespace: Option<String>,
}

impl RequestContext {
    fn for_request(request: &Request<Body>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            operation: CacheOperation::from_path(request.uri().path()),
            namespace: namespace_param(request.uri().query()),
        }
    }

    fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("*")
    }
}

fn namespace_param(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("namespace="))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::for_request(&request);
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Audit entry removals and log failures with the error chain stashed by
/// [`ErrorReport::attach`].
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let start = Instant::now();
    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| RequestContext::for_request(&request));

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if !(status.is_client_error() || status.is_server_error()) {
        if ctx.operation.removes_entries() {
            info!(
                target = "analytics_relay::http::response",
                op = ctx.operation.as_str(),
                namespace = ctx.namespace(),
                status = status.as_u16(),
                elapsed_ms,
                request_id = %ctx.request_id,
                "Cache maintenance request served"
            );
        }
        return response;
    }

    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "analytics_relay::http::response",
            op = ctx.operation.as_str(),
            namespace = ctx.namespace(),
            status = status.as_u16(),
            method = %method,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            request_id = %ctx.request_id,
            "Cache status request failed"
        );
    } else {
        warn!(
            target = "analytics_relay::http::response",
            op = ctx.operation.as_str(),
            namespace = ctx.namespace(),
            status = status.as_u16(),
            method = %method,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            request_id = %ctx.request_id,
            "Cache status request rejected"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_map_to_cache_operations() {
        assert_eq!(CacheOperation::from_path("/api/cache/clear"), CacheOperation::Clear);
        assert_eq!(CacheOperation::from_path("/api/cache/health/"), CacheOperation::Health);
        assert_eq!(CacheOperation::from_path("/api/cache/nope"), CacheOperation::Unknown);
        assert!(CacheOperation::Repair.removes_entries());
        assert!(!CacheOperation::Stats.removes_entries());
    }

    #[test]
    fn namespace_is_read_from_the_query_string() {
        assert_eq!(namespace_param(Some("namespace=gsc_report")).as_deref(), Some("gsc_report"));
        assert_eq!(namespace_param(Some("x=1&namespace=ga4_report")).as_deref(), Some("ga4_report"));
        assert_eq!(namespace_param(Some("namespace=")), None);
        assert_eq!(namespace_param(None), None);
    }
}
