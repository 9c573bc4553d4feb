//! Brings the catalog entry of one table into the state produced by a job.
//!
//! ```text
//! ABSENT  --create-->  PRESENT
//! PRESENT --replace--> PRESENT   (overwrite)
//! PRESENT --extend-->  PRESENT   (incremental)
//! ```
//!
//! Every transition runs under the table lock and commits with a single
//! conditional catalog write. When the catalog already holds the target
//! state the reconciler reports [`ReconcileOutcome::Unchanged`] and writes
//! nothing, which is what makes re-running a job safe.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use log::info;
use serde::Serialize;

use super::{
    Catalog, CatalogApiError, INGEST_BATCH_KEY, PartitionEntry, TableLockGuard, TableLocks,
    TableRecord,
    schema_compat::{align_to_table, same_shape},
};
use crate::{
    config::LoadMode,
    error::{LoaderError, LoaderResult},
    job::{ConversionJob, Deadline},
    schema::ColumnSchema,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created,
    Replaced,
    Extended,
    Unchanged,
}

impl ReconcileOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Replaced => "replaced",
            ReconcileOutcome::Extended => "extended",
            ReconcileOutcome::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog state a job wants to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTarget {
    pub database: String,
    pub table: String,
    /// Schema of the files the job wrote.
    pub columns: ColumnSchema,
    /// `s3://` URI of the table root.
    pub table_location: String,
    /// `s3://` URI of the data written by this job.
    pub data_location: String,
    /// Partition to register; required for incremental loads.
    pub partition: Option<PartitionEntry>,
    /// Version of the record the file schema was aligned against.
    pub based_on_version: Option<u64>,
}

impl CatalogTarget {
    pub fn for_job(job: &ConversionJob, based_on_version: Option<u64>) -> Self {
        let partition = job
            .target
            .partition_value
            .as_ref()
            .map(|value| PartitionEntry {
                values: vec![value.clone()],
                location: job.target.data_uri(),
                source: job.source.object_ref().to_string(),
                discriminator: job.table.discriminator.clone(),
                source_arrival: job.source.arrival,
                registered_at: Utc::now(),
            });
        CatalogTarget {
            database: job.database.clone(),
            table: job.table.table.clone(),
            columns: job.schema.clone(),
            table_location: job.target.table_uri(),
            data_location: job.target.data_uri(),
            partition,
            based_on_version,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    fn record(&self, mode: LoadMode) -> TableRecord {
        let (location, partition_keys, partitions) = match mode {
            LoadMode::Overwrite => (self.data_location.clone(), Vec::new(), Vec::new()),
            LoadMode::Incremental => (
                self.table_location.clone(),
                vec![INGEST_BATCH_KEY.to_string()],
                self.partition.iter().cloned().collect(),
            ),
        };
        TableRecord {
            database: self.database.clone(),
            name: self.table.clone(),
            columns: self.columns.clone(),
            location,
            partition_keys,
            partitions,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

pub struct CatalogReconciler {
    catalog: Arc<dyn Catalog>,
    locks: TableLocks,
}

impl CatalogReconciler {
    pub fn new(catalog: Arc<dyn Catalog>, lock_wait: Duration, lock_ttl: Duration) -> Self {
        let locks = TableLocks::new(Arc::clone(&catalog), lock_wait, lock_ttl);
        CatalogReconciler { catalog, locks }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn lock(
        &self,
        database: &str,
        table: &str,
        deadline: Deadline,
    ) -> LoaderResult<TableLockGuard> {
        self.locks.acquire(database, table, deadline)
    }

    /// Locks the table, applies `target` and releases the lock.
    pub fn reconcile(
        &self,
        target: &CatalogTarget,
        mode: LoadMode,
        deadline: Deadline,
    ) -> LoaderResult<(ReconcileOutcome, TableRecord)> {
        let guard = self.lock(&target.database, &target.table, deadline)?;
        let result = self.apply(&guard, target, mode, deadline);
        let released = guard.release();
        let applied = result?;
        released?;
        Ok(applied)
    }

    /// Returns the schema a job's files must be encoded with, read without
    /// the lock, and the record version it was derived from.
    ///
    /// Overwrite loads and new tables keep the inferred schema. Incremental
    /// loads onto an existing table are aligned to its columns so a text
    /// column keeps absorbing new types. [`apply`](Self::apply) re-checks the
    /// result under the lock.
    pub fn encode_schema(
        &self,
        database: &str,
        table: &str,
        inferred: &ColumnSchema,
        observed: &[usize],
        mode: LoadMode,
    ) -> LoaderResult<(ColumnSchema, Option<u64>)> {
        if mode == LoadMode::Overwrite {
            return Ok((inferred.clone(), None));
        }
        let Some(current) = self.catalog.get_table(database, table)? else {
            return Ok((inferred.clone(), None));
        };
        require_batch_partitioning(&current)?;
        let aligned = align_to_table(&current.columns, inferred, Some(observed))
            .map_err(|err| err.into_conflict(&current.qualified_name()))?;
        Ok((aligned, Some(current.version)))
    }

    /// Applies `target` while `guard` holds the table lock.
    pub fn apply(
        &self,
        guard: &TableLockGuard,
        target: &CatalogTarget,
        mode: LoadMode,
        deadline: Deadline,
    ) -> LoaderResult<(ReconcileOutcome, TableRecord)> {
        deadline.check("catalog")?;
        guard.ensure_live()?;
        if self.catalog.create_database(&target.database)? {
            info!("Created database {}", target.database);
        }

        let current = self.catalog.get_table(&target.database, &target.table)?;
        let (outcome, record) = match (current, mode) {
            (None, _) => {
                let record = self.catalog.create_table(target.record(mode))?;
                (ReconcileOutcome::Created, record)
            }
            (Some(current), LoadMode::Overwrite) => self.replace(current, target)?,
            (Some(current), LoadMode::Incremental) => self.extend(current, target)?,
        };

        info!(
            "Catalog {} for {} (version {}, {} partition(s))",
            outcome,
            record.qualified_name(),
            record.version,
            record.partitions.len()
        );
        Ok((outcome, record))
    }

    fn replace(
        &self,
        current: TableRecord,
        target: &CatalogTarget,
    ) -> LoaderResult<(ReconcileOutcome, TableRecord)> {
        let desired = target.record(LoadMode::Overwrite);
        if current.columns == desired.columns
            && current.location == desired.location
            && !current.is_partitioned()
            && current.partitions.is_empty()
        {
            return Ok((ReconcileOutcome::Unchanged, current));
        }
        let record = self.catalog.replace_table(desired, current.version)?;
        Ok((ReconcileOutcome::Replaced, record))
    }

    fn extend(
        &self,
        current: TableRecord,
        target: &CatalogTarget,
    ) -> LoaderResult<(ReconcileOutcome, TableRecord)> {
        let table = current.qualified_name();
        require_batch_partitioning(&current)?;
        let aligned = align_to_table(&current.columns, &target.columns, None)
            .map_err(|err| err.into_conflict(&table))?;
        if !same_shape(&aligned, &target.columns) {
            // The files were encoded against an older version of the table.
            return Err(CatalogApiError::VersionMismatch {
                table,
                expected: target.based_on_version.unwrap_or(0),
                actual: current.version,
            }
            .into());
        }
        let partition = target.partition.clone().ok_or_else(|| {
            LoaderError::Config(format!("incremental load of {table} has no partition value"))
        })?;
        if current.partition(&partition.values).is_some() {
            return Ok((ReconcileOutcome::Unchanged, current));
        }
        let record = self.catalog.add_partition(
            &current.database,
            &current.name,
            partition,
            current.version,
        )?;
        Ok((ReconcileOutcome::Extended, record))
    }
}

fn require_batch_partitioning(record: &TableRecord) -> LoaderResult<()> {
    if record.partition_keys != [INGEST_BATCH_KEY] {
        return Err(LoaderError::CatalogConflict {
            table: record.qualified_name(),
            column: INGEST_BATCH_KEY.to_string(),
            reason: "is not the partition key of this table; it holds a full snapshot".to_string(),
        });
    }
    Ok(())
}
