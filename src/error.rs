//! Error taxonomy shared by every stage of a conversion job.
//!
//! Each [`LoaderError`] variant maps to a stable, machine-readable kind string
//! (see [`LoaderError::kind`]) that is surfaced in the job result so the
//! external orchestrator can decide whether to retry. Coercion of individual
//! cells to null is not an error and never appears here; it is counted in the
//! job result instead.

use encoding_rs::Encoding;
use thiserror::Error;

use crate::{catalog::CatalogApiError, storage::StorageError};

pub type LoaderResult<T> = Result<T, LoaderError>;

#[derive(Debug, Error)]
pub enum LoaderError {
    /// Malformed, empty or inconsistent delimited input.
    #[error("schema error: {message}{}", location_suffix(.row, .column))]
    Schema {
        message: String,
        row: Option<usize>,
        column: Option<String>,
    },

    /// The object key cannot be turned into a table name.
    #[error("naming error: {0}")]
    Naming(String),

    /// The resolved configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Incremental load against a table whose registered schema differs.
    #[error("catalog conflict on {table}: column '{column}' {reason}")]
    CatalogConflict {
        table: String,
        column: String,
        reason: String,
    },

    /// Another job held the table lock for longer than the bounded wait.
    #[error("timed out after {waited_ms} ms waiting for the catalog lock on {table}")]
    CatalogLockTimeout { table: String, waited_ms: u128 },

    /// A field is not valid in the encoding chosen for the file.
    #[error("schema error: field {field} is not valid {} (row {row})", .encoding.name())]
    Undecodable {
        encoding: &'static Encoding,
        row: usize,
        field: usize,
    },

    /// Parquet/Arrow failure while encoding rows.
    #[error("encode error: {0}")]
    Encode(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogApiError),

    /// The caller-supplied deadline passed before the stage completed.
    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },
}

fn location_suffix(row: &Option<usize>, column: &Option<String>) -> String {
    match (row, column) {
        (Some(row), Some(column)) => format!(" (row {row}, column '{column}')"),
        (Some(row), None) => format!(" (row {row})"),
        (None, Some(column)) => format!(" (column '{column}')"),
        (None, None) => String::new(),
    }
}

impl LoaderError {
    pub fn schema(message: impl Into<String>) -> Self {
        LoaderError::Schema {
            message: message.into(),
            row: None,
            column: None,
        }
    }

    pub fn schema_at(message: impl Into<String>, row: usize, column: Option<&str>) -> Self {
        LoaderError::Schema {
            message: message.into(),
            row: Some(row),
            column: column.map(str::to_string),
        }
    }

    /// Stable identifier reported to the orchestrator.
    pub fn kind(&self) -> &'static str {
        self.classify().0
    }

    /// Whether re-running the job may succeed. Fixed per [`kind`](Self::kind).
    pub fn is_retryable(&self) -> bool {
        self.classify().1
    }

    fn classify(&self) -> (&'static str, bool) {
        match self {
            LoaderError::Schema { .. } | LoaderError::Undecodable { .. } => ("SchemaError", false),
            LoaderError::Naming(_) => ("NamingError", false),
            LoaderError::Config(_) => ("ConfigError", false),
            LoaderError::CatalogConflict { .. } => ("CatalogConflictError", false),
            LoaderError::CatalogLockTimeout { .. } => ("CatalogLockTimeoutError", true),
            LoaderError::Encode(_) => ("EncodeError", false),
            LoaderError::DeadlineExceeded { .. } => ("DeadlineExceeded", true),
            LoaderError::Storage(err) => match err {
                StorageError::NotFound { .. } => ("SourceNotFound", false),
                StorageError::InvalidKey(_) => ("InvalidInputError", false),
                StorageError::AlreadyExists { .. } | StorageError::Io { .. } => {
                    ("TransientIoError", true)
                }
            },
            LoaderError::Catalog(err) => match err {
                CatalogApiError::InvalidName(_) => ("InvalidInputError", false),
                CatalogApiError::Corrupt { .. } => ("CatalogCorruptError", false),
                // The record moved under the job; a re-run reads it again.
                CatalogApiError::VersionMismatch { .. }
                | CatalogApiError::LeaseHeld { .. }
                | CatalogApiError::NotFound { .. }
                | CatalogApiError::AlreadyExists { .. } => ("CatalogConcurrencyError", true),
                CatalogApiError::Io { .. } | CatalogApiError::Unavailable(_) => {
                    ("TransientIoError", true)
                }
            },
        }
    }
}

impl From<csv::Error> for LoaderError {
    fn from(err: csv::Error) -> Self {
        let row = err.position().map(|pos| pos.line() as usize);
        match err.kind() {
            csv::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                LoaderError::DeadlineExceeded { stage: "read" }
            }
            csv::ErrorKind::Io(_) => LoaderError::Storage(StorageError::Io {
                path: "<source stream>".to_string(),
                source: std::io::Error::other(err.to_string()),
            }),
            csv::ErrorKind::UnequalLengths {
                expected_len, len, ..
            } => LoaderError::Schema {
                message: format!("inconsistent column count: expected {expected_len}, found {len}"),
                row,
                column: None,
            },
            _ => LoaderError::Schema {
                message: err.to_string(),
                row,
                column: None,
            },
        }
    }
}

impl From<arrow::error::ArrowError> for LoaderError {
    fn from(err: arrow::error::ArrowError) -> Self {
        LoaderError::Encode(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for LoaderError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        LoaderError::Encode(err.to_string())
    }
}
