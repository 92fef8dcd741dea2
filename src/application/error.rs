use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{
    application::{fanout::FetchError, query::QueryError},
    domain::error::ValidationError,
    infra::error::InfraError,
};

/// Full error chain kept in response extensions for logging middleware;
/// clients only ever see the public message.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Upstream(FetchError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(err) if err.retry_recommended() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Infra(_) | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Validation messages are safe to show; everything else is summarised.
    fn presentation_message(&self) -> String {
        match self {
            AppError::Validation(err) => err.to_string(),
            AppError::Upstream(_) => "Upstream analytics service failed".to_string(),
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured".to_string(),
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start".to_string(),
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request".to_string(),
            AppError::Unexpected(_) => "Unexpected error occurred".to_string(),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(error: QueryError) -> Self {
        match error {
            QueryError::Validation(err) => Self::Validation(err),
            QueryError::Discovery(err) => Self::Upstream(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "status": "error",
            "message": self.presentation_message(),
        });
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_client_errors() {
        let err = AppError::from(ValidationError::missing_field("targets"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.presentation_message(), "required field `targets` is empty");
    }

    #[test]
    fn discovery_failures_follow_retry_table() {
        let transient = AppError::from(QueryError::Discovery(FetchError::transient("rate limited")));
        let access = AppError::from(QueryError::Discovery(FetchError::access("forbidden")));
        assert_eq!(transient.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(access.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn response_carries_report_extension() {
        let response = AppError::unexpected("boom").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let report = response.extensions().get::<ErrorReport>().expect("report");
        assert_eq!(report.messages, vec!["unexpected error: boom".to_string()]);
    }
}
