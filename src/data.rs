use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

/// How `a/b/yyyy` dates are read. Year-first, dashed and dotted forms are
/// unambiguous and accepted under either order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    #[default]
    DayFirst,
    MonthFirst,
}

impl DateOrder {
    pub const ALL: [DateOrder; 2] = [DateOrder::DayFirst, DateOrder::MonthFirst];

    fn date_formats(self) -> &'static [&'static str] {
        match self {
            DateOrder::DayFirst => &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"],
            DateOrder::MonthFirst => &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%d.%m.%Y"],
        }
    }

    fn datetime_formats(self) -> &'static [&'static str] {
        match self {
            DateOrder::DayFirst => &[
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M",
                "%Y-%m-%dT%H:%M",
                "%d/%m/%Y %H:%M:%S",
            ],
            DateOrder::MonthFirst => &[
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M",
                "%Y-%m-%dT%H:%M",
                "%m/%d/%Y %H:%M:%S",
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Outcome of parsing one raw cell against a column type.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(Value),
    /// Empty or a placeholder token.
    Null,
    /// Present but not parseable as the column type; written as null.
    Invalid,
}

pub fn parse_naive_date(value: &str, order: DateOrder) -> Result<NaiveDate> {
    for fmt in order.date_formats() {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str, order: DateOrder) -> Result<NaiveDateTime> {
    let trimmed = value.strip_suffix('Z').unwrap_or(value);
    for fmt in order.datetime_formats() {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as timestamp"))
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" => Some(true),
        "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Strips thousands separators from an otherwise numeric token.
fn numeric_token(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains(',') {
        std::borrow::Cow::Owned(value.replace(',', ""))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

pub fn parse_integer(value: &str) -> Option<i64> {
    numeric_token(value).parse().ok()
}

pub fn parse_float(value: &str) -> Option<f64> {
    let token = numeric_token(value);
    // `f64::from_str` accepts "inf"/"nan" spellings; those stay text.
    if !token.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// NBSP-to-space replacement and trimming applied before any typed parse.
pub fn clean_cell(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains('\u{a0}') {
        std::borrow::Cow::Owned(value.replace('\u{a0}', " ").trim().to_string())
    } else {
        std::borrow::Cow::Borrowed(value.trim())
    }
}

/// Tokens that mean "no value" in typed columns.
pub fn is_placeholder(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "na" | "n/a" | "null" | "none" | "nan" | "-"
    )
}

/// Parses a raw cell for a column of type `ty`; `order` applies to date and
/// timestamp columns.
///
/// Text cells are kept verbatim. For every other type the cell is cleaned
/// first, and empty cells or placeholders are genuine nulls.
pub fn parse_cell(value: &str, ty: ColumnType, order: DateOrder) -> Cell {
    if ty == ColumnType::Text {
        return Cell::Value(Value::Text(value.to_string()));
    }
    let cleaned = clean_cell(value);
    let cleaned = cleaned.as_ref();
    if cleaned.is_empty() || is_placeholder(cleaned) {
        return Cell::Null;
    }
    let parsed = match ty {
        ColumnType::Text => Some(Value::Text(value.to_string())),
        ColumnType::Integer => parse_integer(cleaned).map(Value::Integer),
        ColumnType::Float => parse_float(cleaned).map(Value::Float),
        ColumnType::Boolean => parse_boolean(cleaned).map(Value::Boolean),
        ColumnType::Date => parse_naive_date(cleaned, order).ok().map(Value::Date),
        ColumnType::Timestamp => parse_naive_datetime(cleaned, order).ok().map(Value::Timestamp),
    };
    parsed.map_or(Cell::Invalid, Cell::Value)
}
