//! Inclusive reporting date ranges.

use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use time::{Date, Duration, OffsetDateTime, format_description::FormatItem, macros::format_description};

use super::error::ValidationError;

pub const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    start: Date,
    end: Date,
}

impl DateRange {
    pub fn new(start: Date, end: Date) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvertedDateRange {
                start: format_date(start),
                end: format_date(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Both dates must be `YYYY-MM-DD` and `start <= end`.
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Self::new(parse_date("start_date", start)?, parse_date("end_date", end)?)
    }

    /// The `days` days ending at `today`.
    pub fn last_days(days: i64, today: Date) -> Self {
        let start = today
            .checked_sub(Duration::days(days.max(0)))
            .unwrap_or(Date::MIN);
        Self { start, end: today }
    }

    /// Explicit bounds when both are given, the default lookback when neither
    /// is, and an error when only one is.
    pub fn resolve(start: Option<&str>, end: Option<&str>, today: Date) -> Result<Self, ValidationError> {
        let start = start.map(str::trim).filter(|value| !value.is_empty());
        let end = end.map(str::trim).filter(|value| !value.is_empty());
        match (start, end) {
            (Some(start), Some(end)) => Self::parse(start, end),
            (None, None) => Ok(Self::last_days(DEFAULT_LOOKBACK_DAYS, today)),
            (Some(_), None) => Err(ValidationError::missing_field("end_date")),
            (None, Some(_)) => Err(ValidationError::missing_field("start_date")),
        }
    }

    pub fn start(&self) -> Date {
        self.start
    }

    pub fn end(&self) -> Date {
        self.end
    }

    pub fn start_str(&self) -> String {
        format_date(self.start)
    }

    pub fn end_str(&self) -> String {
        format_date(self.end)
    }
}

impl Serialize for DateRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DateRange", 2)?;
        state.serialize_field("start_date", &self.start_str())?;
        state.serialize_field("end_date", &self.end_str())?;
        state.end()
    }
}

pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

fn parse_date(field: &'static str, value: &str) -> Result<Date, ValidationError> {
    let value = value.trim();
    // `[year]` alone would also accept signed and five-digit years.
    let shaped = value.len() == 10 && value.bytes().next().is_some_and(|b| b.is_ascii_digit());
    shaped
        .then(|| Date::parse(value, DATE_FORMAT).ok())
        .flatten()
        .ok_or_else(|| ValidationError::InvalidDate {
            field,
            value: value.to_string(),
        })
}

fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT)
        .unwrap_or_else(|_| date.to_string())
}
