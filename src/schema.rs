//! Column schema model and type inference.
//!
//! This module owns the [`ColumnSchema`] struct (the ordered, typed column list
//! registered in the catalog and written to Parquet), the [`ColumnType`] enum,
//! header normalization, and the [`SchemaInferer`] that samples rows to detect
//! types.
//!
//! ## Inference policy
//!
//! - Header names are normalized to catalog identifiers; two headers that
//!   normalize to the same name are a [`LoaderError::Schema`].
//! - Up to `sample_rows` data rows are inspected (`0` scans the whole file).
//! - With typing disabled every column is [`ColumnType::Text`].
//! - With typing enabled each candidate type counts how many non-null
//!   sampled values it parses. The candidate parsing the most values wins,
//!   ties going to the earlier of integer → float → boolean → date →
//!   timestamp, provided it parses at least two thirds of them. The rest are
//!   nulled at encode time. Otherwise the column is text. Empty cells and
//!   placeholder tokens are ignored; a column with no observed values stays
//!   text.
//! - Date and timestamp columns settle on one [`DateOrder`] for `a/b/yyyy`
//!   values, chosen the same way.
//! - Text columns are not nullable: every cell, empty or not, is written
//!   verbatim. Typed columns are nullable.

use std::{fmt, io::Read, str::FromStr};

use encoding_rs::Encoding;
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    config::TypingPolicy,
    data::{
        DateOrder, clean_cell, is_placeholder, parse_boolean, parse_float, parse_integer,
        parse_naive_date, parse_naive_datetime,
    },
    error::{LoaderError, LoaderResult},
    io_utils, naming,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &["text", "integer", "float", "boolean", "date", "timestamp"]
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Ok(ColumnType::Text),
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "float" | "double" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            _ => Err(format!(
                "Unknown column type '{value}'. Supported types: {}",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        ColumnType::from_str(&token).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: ColumnType,
    pub nullable: bool,
    /// Header text as it appeared in the source file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Reading of `a/b/yyyy` values; set for date and timestamp columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_order: Option<DateOrder>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool) -> Self {
        ColumnDef {
            name: name.into(),
            data_type,
            nullable,
            source_name: None,
            date_order: None,
        }
    }

    pub fn with_date_order(mut self, order: DateOrder) -> Self {
        self.date_order = Some(order);
        self
    }
}

/// Ordered column list; order is significant end to end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSchema {
    pub columns: Vec<ColumnDef>,
}

impl ColumnSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        ColumnSchema { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_text_only(&self) -> bool {
        self.columns
            .iter()
            .all(|c| c.data_type == ColumnType::Text)
    }

    /// Compact `name:type` rendering for log lines.
    pub fn describe(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.data_type))
            .join(", ")
    }
}

/// Normalizes raw headers into unique catalog identifiers.
///
/// Empty names become `col`, names that do not start with a letter get a
/// `c_` prefix. Collisions are rejected rather than renamed.
pub fn normalize_headers(headers: &[String]) -> LoaderResult<Vec<String>> {
    if headers.is_empty() {
        return Err(LoaderError::schema_at("header row is empty", 1, None));
    }
    let normalized: Vec<String> = headers
        .iter()
        .map(|raw| {
            let mut name = naming::normalize_identifier(raw);
            if name.is_empty() {
                name = "col".to_string();
            } else if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
                name.insert_str(0, "c_");
            }
            name
        })
        .collect();

    if let Some(duplicate) = normalized.iter().duplicates().next() {
        let sources = headers
            .iter()
            .zip(&normalized)
            .filter(|(_, name)| *name == duplicate)
            .map(|(raw, _)| format!("'{raw}'"))
            .join(", ");
        return Err(LoaderError::Schema {
            message: format!("header collision: {sources} all normalize to '{duplicate}'"),
            row: Some(1),
            column: Some(duplicate.clone()),
        });
    }
    Ok(normalized)
}

/// True when `parsed` of `observed` values is at least two thirds.
fn meets_typed_share(parsed: usize, observed: usize) -> bool {
    parsed > 0 && parsed * 3 >= observed * 2
}

/// Per-column parse counts over the sample.
#[derive(Debug, Clone, Default)]
struct TypeCandidate {
    observed: usize,
    integer: usize,
    float: usize,
    boolean: usize,
    /// Indexed like [`DateOrder::ALL`].
    date: [usize; 2],
    timestamp: [usize; 2],
}

impl TypeCandidate {
    fn update(&mut self, raw: &str) {
        let cleaned = clean_cell(raw);
        let value = cleaned.as_ref();
        if value.is_empty() || is_placeholder(value) {
            return;
        }
        self.observed += 1;
        self.integer += usize::from(parse_integer(value).is_some());
        self.float += usize::from(parse_float(value).is_some());
        self.boolean += usize::from(parse_boolean(value).is_some());
        for (idx, order) in DateOrder::ALL.into_iter().enumerate() {
            self.date[idx] += usize::from(parse_naive_date(value, order).is_ok());
            self.timestamp[idx] += usize::from(parse_naive_datetime(value, order).is_ok());
        }
    }

    fn decide(&self) -> (ColumnType, Option<DateOrder>) {
        let [day_first, month_first] = DateOrder::ALL;
        let candidates = [
            (ColumnType::Integer, None, self.integer),
            (ColumnType::Float, None, self.float),
            (ColumnType::Boolean, None, self.boolean),
            (ColumnType::Date, Some(day_first), self.date[0]),
            (ColumnType::Date, Some(month_first), self.date[1]),
            (ColumnType::Timestamp, Some(day_first), self.timestamp[0]),
            (ColumnType::Timestamp, Some(month_first), self.timestamp[1]),
        ];
        let mut best = (ColumnType::Text, None, 0);
        for candidate in candidates {
            if candidate.2 > best.2 {
                best = candidate;
            }
        }
        if meets_typed_share(best.2, self.observed) {
            (best.0, best.1)
        } else {
            (ColumnType::Text, None)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferenceStats {
    pub rows_sampled: usize,
    /// True when the sample reached the end of the file.
    pub full_scan: bool,
    /// Non-null values seen per column, in column order.
    pub observed_values: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchemaInferer {
    pub typing: TypingPolicy,
    /// Maximum data rows to inspect; `0` reads the whole file.
    pub sample_rows: usize,
}

impl SchemaInferer {
    pub fn new(typing: TypingPolicy, sample_rows: usize) -> Self {
        SchemaInferer {
            typing,
            sample_rows,
        }
    }

    /// Infers the schema from a reader positioned at the header row.
    pub fn infer<R: Read>(
        &self,
        reader: &mut csv::Reader<R>,
        encoding: &'static Encoding,
    ) -> LoaderResult<(ColumnSchema, InferenceStats)> {
        let raw_headers = io_utils::reader_headers(reader, encoding)?;
        let names = normalize_headers(&raw_headers)?;
        let mut candidates = vec![TypeCandidate::default(); names.len()];

        let mut record = csv::ByteRecord::new();
        let mut stats = InferenceStats::default();
        loop {
            if self.sample_rows > 0 && stats.rows_sampled >= self.sample_rows {
                break;
            }
            if !reader.read_byte_record(&mut record)? {
                stats.full_scan = true;
                break;
            }
            let row = stats.rows_sampled + 2;
            let decoded = io_utils::decode_record(&record, encoding, row)?;
            for (candidate, value) in candidates.iter_mut().zip(&decoded) {
                candidate.update(value);
            }
            stats.rows_sampled += 1;
        }

        if stats.rows_sampled == 0 {
            return Err(LoaderError::schema("file contains a header but no data rows"));
        }
        stats.observed_values = candidates.iter().map(|c| c.observed).collect();

        let columns = names
            .into_iter()
            .zip(raw_headers)
            .zip(&candidates)
            .map(|((name, source), candidate)| {
                let (data_type, date_order) = if self.typing.allow_type_conversions {
                    candidate.decide()
                } else {
                    (ColumnType::Text, None)
                };
                ColumnDef {
                    source_name: (source != name).then_some(source),
                    name,
                    data_type,
                    nullable: data_type != ColumnType::Text,
                    date_order,
                }
            })
            .collect();

        Ok((ColumnSchema::new(columns), stats))
    }
}
