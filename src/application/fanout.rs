//! Bounded-concurrency fan-out of one query across many targets.
//!
//! Every distinct target gets exactly one [`FanOutResult`]; later aliases of
//! an earlier target are dropped before anything is fetched. A failing, panicking or
//! timed-out fetch is recorded against its own target and never disturbs its
//! siblings. The orchestrator does not retry; callers decide based on
//! `retry_recommended`.

use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::domain::rows::{self, Row};
use crate::domain::targets::{self, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    NoData,
    Failed,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoData => "no_data",
            Self::Failed => "failed",
        }
    }

    /// `no_data` is a successful fetch that happened to return nothing.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::NoData)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Success,
    PartialSuccess,
    Error,
}

impl AggregateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Error => "error",
        }
    }
}

/// Failure classes a fetch function can report.
///
/// | kind         | retry recommended |
/// |--------------|-------------------|
/// | `Transient`  | yes               |
/// | `Other`      | yes               |
/// | `Access`     | no                |
/// | `Validation` | no                |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Caller lacks permission or the target does not exist upstream.
    Access,
    /// Timeout, rate limit, quota or a transient upstream fault.
    Transient,
    /// Upstream rejected the request shape.
    Validation,
    /// Anything unclassified.
    Other,
}

impl FetchErrorKind {
    pub fn retry_recommended(self) -> bool {
        match self {
            Self::Transient | Self::Other => true,
            Self::Access | Self::Validation => false,
        }
    }

    /// Classification for fetchers that only see an HTTP status.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 | 404 => Self::Access,
            408 | 429 | 500..=599 => Self::Transient,
            400 | 422 => Self::Validation,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }
}

/// Error returned by a per-target fetch. `message` is surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn access(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Access, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Validation, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Other, message)
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self::transient(format!("fetch timed out after {}s", limit.as_secs_f64()))
    }

    pub fn retry_recommended(&self) -> bool {
        self.kind.retry_recommended()
    }
}

/// Outcome for one target of one orchestration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutResult {
    pub target: Target,
    pub status: TargetStatus,
    pub rows_contributed: usize,
    pub error: Option<String>,
    pub error_kind: Option<FetchErrorKind>,
    pub retry_recommended: Option<bool>,
}

impl FanOutResult {
    fn fetched(target: Target, rows: usize) -> Self {
        Self {
            target,
            status: if rows == 0 {
                TargetStatus::NoData
            } else {
                TargetStatus::Success
            },
            rows_contributed: rows,
            error: None,
            error_kind: None,
            retry_recommended: None,
        }
    }

    fn failed(target: Target, error: FetchError) -> Self {
        Self {
            target,
            status: TargetStatus::Failed,
            rows_contributed: 0,
            retry_recommended: Some(error.retry_recommended()),
            error_kind: Some(error.kind),
            error: Some(error.message),
        }
    }
}

/// Everything one [`FanOut::run`] produced. Results follow submission order;
/// `combined_rows` holds every successful row tagged with its target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOutReport {
    pub results: Vec<FanOutResult>,
    pub combined_rows: Vec<Row>,
}

impl FanOutReport {
    pub fn status(&self) -> AggregateStatus {
        aggregate_status(&self.results)
    }
}

/// `success` when nothing failed, `partial_success` when some targets
/// succeeded and some failed, `error` when none succeeded (including when
/// there were no targets at all).
pub fn aggregate_status(results: &[FanOutResult]) -> AggregateStatus {
    let succeeded = results.iter().filter(|result| result.status.is_success()).count();
    let failed = results.len() - succeeded;
    match (succeeded, failed) {
        (0, _) => AggregateStatus::Error,
        (_, 0) => AggregateStatus::Success,
        _ => AggregateStatus::PartialSuccess,
    }
}

#[derive(Debug, Clone)]
pub struct FanOut {
    concurrency_limit: NonZeroUsize,
    timeout: Option<Duration>,
}

impl FanOut {
    pub fn new(concurrency_limit: NonZeroUsize) -> Self {
        Self {
            concurrency_limit,
            timeout: None,
        }
    }

    /// Fail any single fetch that runs longer than `limit` as transient.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn concurrency_limit(&self) -> NonZeroUsize {
        self.concurrency_limit
    }

    /// Run `fetch` for every target with at most `concurrency_limit` in
    /// flight. Waiting targets suspend on the semaphore without spinning.
    pub async fn run<F, Fut>(&self, targets: &[Target], fetch: F) -> FanOutReport
    where
        F: Fn(Target) -> Fut,
        Fut: Future<Output = Result<Vec<Row>, FetchError>>,
    {
        let started_at = Instant::now();
        let requested = targets.len();
        let targets = targets::dedupe(targets.to_vec());
        let permits = Semaphore::new(self.concurrency_limit.get());
        info!(
            target = "analytics_relay::application::fanout",
            op = "fanout::run",
            targets = targets.len(),
            concurrency_limit = self.concurrency_limit.get(),
            "Fan-out started"
        );
        if targets.len() < requested {
            debug!(
                target = "analytics_relay::application::fanout",
                op = "fanout::run",
                dropped = requested - targets.len(),
                "Dropped duplicate targets"
            );
        }

        let calls = targets.iter().map(|target| {
            let permits = &permits;
            let fetch = &fetch;
            async move {
                let outcome = match permits.acquire().await {
                    Ok(_permit) => self.call(fetch, target.clone()).await,
                    Err(_) => Err(FetchError::other("fan-out scheduler closed")),
                };
                (target, outcome)
            }
        });
        let outcomes = join_all(calls).await;

        let mut report = FanOutReport::default();
        for (target, outcome) in outcomes {
            let result = match outcome {
                Ok(rows) => {
                    let field = target.kind.attribution_field();
                    let count = rows.len();
                    report
                        .combined_rows
                        .extend(rows.into_iter().map(|row| rows::attribute(row, field, &target.id)));
                    FanOutResult::fetched(target.clone(), count)
                }
                Err(error) => {
                    warn!(
                        target = "analytics_relay::application::fanout",
                        op = "fanout::fetch",
                        target_id = %target,
                        error_kind = error.kind.as_str(),
                        retry_recommended = error.retry_recommended(),
                        error = %error,
                        "Target fetch failed"
                    );
                    FanOutResult::failed(target.clone(), error)
                }
            };
            counter!("relay_fanout_target_total", "status" => result.status.as_str()).increment(1);
            report.results.push(result);
        }

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!("relay_fanout_ms").record(elapsed_ms);
        info!(
            target = "analytics_relay::application::fanout",
            op = "fanout::run",
            result = report.status().as_str(),
            targets = report.results.len(),
            rows = report.combined_rows.len(),
            elapsed_ms = elapsed_ms as u64,
            "Fan-out finished"
        );
        report
    }

    async fn call<F, Fut>(&self, fetch: &F, target: Target) -> Result<Vec<Row>, FetchError>
    where
        F: Fn(Target) -> Fut,
        Fut: Future<Output = Result<Vec<Row>, FetchError>>,
    {
        let guarded = AssertUnwindSafe(fetch(target)).catch_unwind();
        let caught = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => caught,
                Err(_) => return Err(FetchError::timed_out(limit)),
            },
            None => guarded.await,
        };
        caught.unwrap_or_else(|panic| Err(FetchError::other(format!("fetch panicked: {}", panic_message(&panic)))))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
