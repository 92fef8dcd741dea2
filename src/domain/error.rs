use thiserror::Error;

/// Caller-level input problems, reported before any fetch is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no valid {kind} supplied (invalid: {})", .invalid.join(", "))]
    NoValidTargets {
        kind: &'static str,
        invalid: Vec<String>,
    },
    #[error("{count} {kind} requested; at most {max} allowed per request")]
    BatchTooLarge {
        kind: &'static str,
        count: usize,
        max: usize,
    },
    #[error("required field `{field}` is empty")]
    MissingField { field: &'static str },
    #[error("invalid {field} `{value}`: expected YYYY-MM-DD")]
    InvalidDate { field: &'static str, value: String },
    #[error("start date {start} is after end date {end}")]
    InvertedDateRange { start: String, end: String },
    #[error("unknown {what} `{value}`")]
    Unknown { what: &'static str, value: String },
}

impl ValidationError {
    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    pub fn unknown(what: &'static str, value: impl Into<String>) -> Self {
        Self::Unknown {
            what,
            value: value.into(),
        }
    }
}
