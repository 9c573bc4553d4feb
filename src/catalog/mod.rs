//! Metadata catalog boundary.
//!
//! A [`Catalog`] stores one [`TableRecord`] per `(database, table)` and a
//! lease per table used for mutual exclusion. Every mutation of a record is a
//! single conditional write against the record's `version`, so a reader always
//! sees either the previous or the next complete record, never a mix.
//!
//! Two implementations ship with the crate: [`MemoryCatalog`] for embedding and
//! tests, and [`FileCatalog`], which keeps JSON documents under a root
//! directory.

mod file;
mod lock;
mod memory;
pub mod reconciler;
pub mod schema_compat;

use std::{io, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::ColumnSchema;

pub use file::FileCatalog;
pub use lock::{TableLockGuard, TableLocks};
pub use memory::MemoryCatalog;
pub use reconciler::{CatalogReconciler, CatalogTarget, ReconcileOutcome};

pub type CatalogResult<T> = Result<T, CatalogApiError>;

/// Partition key used for incremental loads.
pub const INGEST_BATCH_KEY: &str = "ingest_batch";

#[derive(Debug, Error)]
pub enum CatalogApiError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    AlreadyExists { what: String },

    /// Optimistic concurrency check failed.
    #[error("{table} is at version {actual}, expected {expected}")]
    VersionMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },

    #[error("lease on {table} is held by {holder} until {expires_at}")]
    LeaseHeld {
        table: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("'{0}' is not a valid catalog identifier")]
    InvalidName(String),

    #[error("catalog document {path} is unreadable: {message}")]
    Corrupt { path: String, message: String },

    #[error("catalog I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("catalog service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Values in the order of [`TableRecord::partition_keys`].
    pub values: Vec<String>,
    pub location: String,
    /// `s3://bucket/key` of the upload that produced the partition.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// When the source object arrived in the upload bucket.
    pub source_arrival: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    pub database: String,
    pub name: String,
    pub columns: ColumnSchema,
    pub location: String,
    #[serde(default)]
    pub partition_keys: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
    /// Incremented by every committed write; `1` after creation.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TableRecord {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn partition(&self, values: &[String]) -> Option<&PartitionEntry> {
        self.partitions.iter().find(|p| p.values == values)
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partition_keys.is_empty()
    }

    /// Whether the table or one of its partitions points at `location`.
    pub fn references(&self, location: &str) -> bool {
        self.location == location || self.partitions.iter().any(|p| p.location == location)
    }
}

/// Exclusive, expiring claim on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder_id: String,
    pub table: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder_id: impl Into<String>, table: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(365));
        Lease {
            holder_id: holder_id.into(),
            table: table.into(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// The catalog service as seen by the engine. Every call is idempotent
/// except where a version precondition makes it conditional.
pub trait Catalog: Send + Sync {
    /// Returns `true` when the database was created by this call.
    fn create_database(&self, name: &str) -> CatalogResult<bool>;

    fn get_table(&self, database: &str, table: &str) -> CatalogResult<Option<TableRecord>>;

    /// Registers a new table at version 1. Fails with `AlreadyExists` when a
    /// record is present.
    fn create_table(&self, record: TableRecord) -> CatalogResult<TableRecord>;

    /// Swaps schema, location and partitions in one write, provided the
    /// stored record is still at `expected_version`.
    fn replace_table(
        &self,
        record: TableRecord,
        expected_version: u64,
    ) -> CatalogResult<TableRecord>;

    /// Adds `partition` unless a partition with the same values exists, in
    /// which case the stored record is returned untouched.
    fn add_partition(
        &self,
        database: &str,
        table: &str,
        partition: PartitionEntry,
        expected_version: u64,
    ) -> CatalogResult<TableRecord>;

    fn list_partitions(&self, database: &str, table: &str) -> CatalogResult<Vec<PartitionEntry>> {
        self.get_table(database, table)?
            .map(|record| record.partitions)
            .ok_or_else(|| CatalogApiError::NotFound {
                what: format!("table {database}.{table}"),
            })
    }

    fn list_tables(&self, database: &str) -> CatalogResult<Vec<String>>;

    /// Creates the lease if absent or expired; `LeaseHeld` otherwise.
    fn try_acquire_lease(
        &self,
        database: &str,
        table: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CatalogResult<Lease>;

    /// Removes the lease if `holder_id` still owns it.
    fn release_lease(&self, database: &str, table: &str, holder_id: &str) -> CatalogResult<()>;
}

/// Applies the commit bookkeeping shared by every implementation.
fn next_version(mut record: TableRecord, version: u64) -> TableRecord {
    record.version = version;
    record.updated_at = Utc::now();
    record
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};

    pub fn record(database: &str, name: &str, location: &str) -> TableRecord {
        TableRecord {
            database: database.to_string(),
            name: name.to_string(),
            columns: ColumnSchema::new(vec![
                ColumnDef::new("id", ColumnType::Integer, true),
                ColumnDef::new("name", ColumnType::Text, true),
            ]),
            location: location.to_string(),
            partition_keys: Vec::new(),
            partitions: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn partition(value: &str) -> PartitionEntry {
        PartitionEntry {
            values: vec![value.to_string()],
            location: format!("s3://lake/t/{INGEST_BATCH_KEY}={value}/"),
            source: "s3://raw/t.csv".to_string(),
            discriminator: None,
            source_arrival: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    /// Contract every implementation must satisfy.
    pub fn exercise_catalog(catalog: &dyn Catalog) {
        assert!(catalog.create_database("sales").unwrap());
        assert!(!catalog.create_database("sales").unwrap());
        assert!(catalog.get_table("sales", "orders").unwrap().is_none());

        let created = catalog
            .create_table(record("sales", "orders", "s3://lake/orders/"))
            .unwrap();
        assert_eq!(created.version, 1);
        assert!(matches!(
            catalog.create_table(record("sales", "orders", "s3://lake/orders/")),
            Err(CatalogApiError::AlreadyExists { .. })
        ));

        let mut next = created.clone();
        next.location = "s3://lake/orders/snapshot=b/".to_string();
        let replaced = catalog.replace_table(next.clone(), 1).unwrap();
        assert_eq!(replaced.version, 2);
        assert!(matches!(
            catalog.replace_table(next, 1),
            Err(CatalogApiError::VersionMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        let extended = catalog
            .add_partition("sales", "orders", partition("p1"), 2)
            .unwrap();
        assert_eq!(extended.version, 3);
        let again = catalog
            .add_partition("sales", "orders", partition("p1"), 3)
            .unwrap();
        assert_eq!(again.version, 3);
        assert_eq!(catalog.list_partitions("sales", "orders").unwrap().len(), 1);
        assert!(catalog.list_partitions("sales", "missing").is_err());
        assert_eq!(catalog.list_tables("sales").unwrap(), vec!["orders"]);

        let lease = catalog
            .try_acquire_lease("sales", "orders", "holder-a", Duration::from_secs(60))
            .unwrap();
        assert_eq!(lease.holder_id, "holder-a");
        let err = catalog
            .try_acquire_lease("sales", "orders", "holder-b", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CatalogApiError::LeaseHeld { .. }));
        catalog.release_lease("sales", "orders", "holder-b").unwrap();
        assert!(
            catalog
                .try_acquire_lease("sales", "orders", "holder-b", Duration::from_secs(60))
                .is_err(),
            "a non-owner release must not drop the lease"
        );
        catalog.release_lease("sales", "orders", "holder-a").unwrap();
        catalog
            .try_acquire_lease("sales", "orders", "holder-b", Duration::from_secs(60))
            .unwrap();
        catalog.release_lease("sales", "orders", "holder-b").unwrap();

        catalog
            .try_acquire_lease("sales", "orders", "stale", Duration::ZERO)
            .unwrap();
        catalog
            .try_acquire_lease("sales", "orders", "fresh", Duration::from_secs(60))
            .expect("expired leases can be taken over");
        catalog.release_lease("sales", "orders", "fresh").unwrap();
    }
}
