//! Per-invocation job model: the workflow contract, the resolved
//! [`ConversionJob`], deadlines, and the [`JobResult`] returned to the
//! orchestrator.

use std::{
    fmt,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::{LoadMode, TypingPolicy},
    error::{LoaderError, LoaderResult},
    naming::TableName,
    schema::ColumnSchema,
};

const SOURCE_TOKEN_LEN: usize = 16;

/// Caller-supplied time limit shared by every stage of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Deadline { at: None }
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub fn expired() -> Self {
        Deadline {
            at: Some(Instant::now()),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self, stage: &'static str) -> LoaderResult<()> {
        if self.is_expired() {
            Err(LoaderError::DeadlineExceeded { stage })
        } else {
            Ok(())
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        ObjectRef {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Input document of one workflow execution: `{"source": {"bucket", "key"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub source: ObjectRef,
}

impl WorkflowInput {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        WorkflowInput {
            source: ObjectRef::new(bucket, key),
        }
    }
}

/// One observed upload. Immutable once read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub arrival: DateTime<Utc>,
}

impl SourceObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.key)
    }

    /// Short content-addressed identity of this upload.
    ///
    /// Same bucket, key and ETag always give the same token, so re-running a
    /// job lands on the same output paths and partition value.
    pub fn token(&self) -> String {
        source_token(&self.bucket, &self.key, &self.etag)
    }
}

pub fn source_token(bucket: &str, key: &str, etag: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bucket.as_bytes());
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    hasher.update(b"/");
    hasher.update(etag.trim_matches('"').as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..SOURCE_TOKEN_LEN].to_string()
}

/// Where a job's Parquet files end up in the output bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLocation {
    pub bucket: String,
    /// Prefix shared by every file of the table, ending in `/`.
    pub table_prefix: String,
    /// Prefix that receives this job's files, ending in `/`.
    pub data_prefix: String,
    /// Value of the `ingest_batch` partition key for incremental loads.
    pub partition_value: Option<String>,
}

impl TargetLocation {
    pub fn table_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.table_prefix)
    }

    pub fn data_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.data_prefix)
    }
}

/// Everything needed to run a conversion; resolved before any write.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: String,
    pub source: SourceObject,
    pub table: TableName,
    pub database: String,
    pub load_mode: LoadMode,
    pub typing: TypingPolicy,
    pub schema: ColumnSchema,
    pub target: TargetLocation,
}

impl ConversionJob {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&LoaderError> for JobError {
    fn from(err: &LoaderError) -> Self {
        JobError {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Output document of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    pub rows_processed: u64,
    pub rows_coerced_to_null: u64,
    pub bytes_written: u64,
    /// Reconciler outcome (`created`, `replaced`, `extended`, `unchanged`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobResult {
    pub fn failed(table_name: Option<String>, err: &LoaderError) -> Self {
        JobResult {
            status: JobStatus::Failed,
            table_name,
            rows_processed: 0,
            rows_coerced_to_null: 0,
            bytes_written: 0,
            catalog_action: None,
            error: Some(JobError::from(err)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_token_is_stable_and_ignores_etag_quotes() {
        let a = source_token("raw", "in/orders.csv", "\"abc\"");
        let b = source_token("raw", "in/orders.csv", "abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, source_token("raw", "in/orders.csv", "abd"));
    }

    #[test]
    fn workflow_input_uses_nested_source_shape() {
        let input: WorkflowInput =
            serde_json::from_str(r#"{"source":{"bucket":"raw","key":"a.csv"}}"#).unwrap();
        assert_eq!(input, WorkflowInput::new("raw", "a.csv"));
        assert_eq!(input.source.to_string(), "s3://raw/a.csv");
    }

    #[test]
    fn failed_result_carries_machine_readable_kind() {
        let err = LoaderError::CatalogLockTimeout {
            table: "db.t".to_string(),
            waited_ms: 10,
        };
        let result = JobResult::failed(Some("t".to_string()), &err);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "CatalogLockTimeoutError");
        assert_eq!(json["error"]["retryable"], true);
        assert!(json.get("catalog_action").is_none());
    }

    #[test]
    fn deadlines_report_expiry() {
        assert!(!Deadline::none().is_expired());
        assert!(Deadline::none().remaining().is_none());
        assert!(Deadline::expired().check("read").is_err());
        assert!(Deadline::after(Duration::from_secs(60)).check("read").is_ok());
    }
}
