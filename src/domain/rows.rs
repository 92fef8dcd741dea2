//! Tabular report rows and numeric aggregation.

use serde_json::{Map, Number, Value};

/// One report row: column name to JSON value. Metric precision survives a
/// cache round-trip because serde_json keeps integers as integers.
pub type Row = Map<String, Value>;

/// Columns that identify a row's source and are never summed.
pub const IDENTIFIER_COLUMNS: &[&str] = &[
    "property_id",
    "property_name",
    "domain",
    "siteUrl",
    "site_url",
    "rootDomain",
    "account",
];

pub fn is_identifier(column: &str) -> bool {
    IDENTIFIER_COLUMNS.contains(&column)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Total {
    Int(i64),
    Float(f64),
}

impl Total {
    fn add(self, value: &Number) -> Self {
        match (self, value.as_i64()) {
            (Self::Int(acc), Some(next)) => acc
                .checked_add(next)
                .map(Self::Int)
                .unwrap_or(Self::Float(acc as f64 + next as f64)),
            (acc, _) => Self::Float(acc.as_f64() + value.as_f64().unwrap_or(0.0)),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Int(value) => Value::from(value),
            Self::Float(value) => Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

/// Sum every numeric, non-identifier column across `rows`. Keys come out
/// sorted; integer columns stay integers until they overflow.
pub fn metric_totals<'a, I>(rows: I) -> Map<String, Value>
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut totals: Vec<(String, Total)> = Vec::new();
    for row in rows {
        for (column, value) in row {
            let Value::Number(number) = value else {
                continue;
            };
            if is_identifier(column) {
                continue;
            }
            match totals.iter_mut().find(|(name, _)| name == column) {
                Some((_, total)) => *total = total.add(number),
                None => totals.push((column.clone(), Total::Int(0).add(number))),
            }
        }
    }
    totals
        .into_iter()
        .map(|(column, total)| (column, total.into_value()))
        .collect()
}

/// Tag `row` with the target it came from.
pub fn attribute(mut row: Row, field: &str, target_id: &str) -> Row {
    row.insert(field.to_string(), Value::String(target_id.to_string()));
    row
}
