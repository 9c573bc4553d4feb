//! One conversion job from source object to registered table.
//!
//! ```text
//! name -> head -> infer -> plan schema -> encode (staging)
//!      -> lock -> publish -> reconcile -> [overwrite: clear old snapshot] -> unlock
//! ```
//!
//! Encoding runs outside the table lock so jobs on the same table only
//! serialize for publish and catalog work. Nothing reaches the catalog unless
//! encoding succeeded; a failure before publish removes the staged files.

use std::{io::BufReader, sync::Arc};

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use log::{debug, info, warn};

use crate::{
    catalog::{
        Catalog, CatalogReconciler, CatalogTarget, INGEST_BATCH_KEY, ReconcileOutcome,
        TableLockGuard,
    },
    config::{LoadMode, LoaderConfig},
    encoder::{ColumnarEncoder, EncoderSettings, StagedOutput},
    error::{LoaderError, LoaderResult},
    io_utils::{self, DeadlineReader, SourceFormat},
    job::{
        ConversionJob, Deadline, JobResult, JobStatus, ObjectRef, SourceObject, TargetLocation,
        WorkflowInput,
    },
    naming::{self, TableName},
    schema::{ColumnSchema, InferenceStats, SchemaInferer},
    storage::ObjectStore,
};

const STAGING_DIR: &str = "_staging";

pub struct ConversionEngine {
    config: LoaderConfig,
    store: Arc<dyn ObjectStore>,
    reconciler: CatalogReconciler,
}

impl ConversionEngine {
    pub fn new(config: LoaderConfig, store: Arc<dyn ObjectStore>, catalog: Arc<dyn Catalog>) -> Self {
        let reconciler = CatalogReconciler::new(catalog, config.lock_wait, config.lock_ttl);
        ConversionEngine {
            config,
            store,
            reconciler,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        self.reconciler.catalog()
    }

    /// Runs one job. Failures are reported in the result, never raised.
    pub fn run(&self, input: &WorkflowInput, deadline: Deadline) -> JobResult {
        let mut table_name = None;
        match self.execute(input, deadline, &mut table_name) {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    "Conversion of {} failed ({}, retryable: {}): {err}",
                    input.source,
                    err.kind(),
                    err.is_retryable()
                );
                JobResult::failed(table_name, &err)
            }
        }
    }

    fn execute(
        &self,
        input: &WorkflowInput,
        deadline: Deadline,
        table_name: &mut Option<String>,
    ) -> LoaderResult<JobResult> {
        self.config.validate()?;
        let table = naming::derive_table_name(&input.source.key, self.config.table_naming)?;
        *table_name = Some(table.table.clone());
        info!(
            "Converting {} into {}.{} ({} load)",
            input.source,
            self.config.target_database,
            table.table,
            self.config.load_mode.as_str()
        );

        deadline.check("read")?;
        let source = self.describe_source(&input.source)?;
        let mut fallback = None;
        let (job, staged, based_on_version) = loop {
            match self.prepare(&source, &table, fallback, deadline) {
                Ok(prepared) => break prepared,
                // Detection only saw the head of the file; re-read all of it.
                Err(LoaderError::Undecodable { encoding, row, .. })
                    if encoding == UTF_8 && fallback.is_none() && self.config.encoding.is_none() =>
                {
                    info!(
                        "{} is not valid UTF-8 at row {row}; reading it as {} instead",
                        source.key,
                        WINDOWS_1252.name()
                    );
                    fallback = Some(WINDOWS_1252);
                }
                Err(err) => return Err(err),
            }
        };

        let outcome = match self.commit(&job, &staged, based_on_version, deadline) {
            Ok(outcome) => outcome,
            Err(err) => {
                staged.discard(self.store.as_ref());
                return Err(err);
            }
        };

        let stats = &staged.stats;
        if stats.rows_coerced_to_null > 0 {
            warn!(
                "{} row(s) of {} had {} value(s) coerced to null",
                stats.rows_coerced_to_null, job.source.key, stats.cells_coerced_to_null
            );
        }
        Ok(JobResult {
            status: JobStatus::Succeeded,
            table_name: Some(job.table.table.clone()),
            rows_processed: stats.rows_processed,
            rows_coerced_to_null: stats.rows_coerced_to_null,
            bytes_written: stats.bytes_written,
            catalog_action: Some(outcome.to_string()),
            error: None,
        })
    }

    /// Infers the schema, aligns it with the table and encodes the file to
    /// staging. `encoding` overrides detection.
    fn prepare(
        &self,
        source: &SourceObject,
        table: &TableName,
        encoding: Option<&'static Encoding>,
        deadline: Deadline,
    ) -> LoaderResult<(ConversionJob, StagedOutput, Option<u64>)> {
        let (format, inferred, stats) = self.infer(source, encoding, deadline)?;
        info!(
            "Inferred {} column(s) from {} sampled row(s): {}",
            inferred.len(),
            stats.rows_sampled,
            inferred.describe()
        );

        let (schema, based_on_version) = self.reconciler.encode_schema(
            &self.config.target_database,
            &table.table,
            &inferred,
            &stats.observed_values,
            self.config.load_mode,
        )?;
        if schema != inferred {
            debug!("Aligned file schema to existing table: {}", schema.describe());
        }

        let job = self.plan(source.clone(), table.clone(), schema);
        let staged = self.encode(&job, &format, deadline)?;
        Ok((job, staged, based_on_version))
    }

    fn describe_source(&self, source: &ObjectRef) -> LoaderResult<SourceObject> {
        let meta = self.store.head(&source.bucket, &source.key)?;
        debug!("{source}: {} bytes, etag {}", meta.size, meta.etag);
        Ok(SourceObject {
            bucket: source.bucket.clone(),
            key: source.key.clone(),
            size: meta.size,
            etag: meta.etag,
            arrival: meta.last_modified,
        })
    }

    fn open_source(
        &self,
        source: &SourceObject,
        deadline: Deadline,
    ) -> LoaderResult<BufReader<DeadlineReader<Box<dyn std::io::Read + Send>>>> {
        let stream = self.store.open(&source.bucket, &source.key)?;
        Ok(BufReader::new(DeadlineReader::new(stream, deadline)))
    }

    fn infer(
        &self,
        source: &SourceObject,
        encoding: Option<&'static Encoding>,
        deadline: Deadline,
    ) -> LoaderResult<(SourceFormat, ColumnSchema, InferenceStats)> {
        let configured = match encoding {
            Some(encoding) => Some(encoding),
            None => io_utils::resolve_encoding(self.config.encoding.as_deref())?,
        };
        let mut stream = self.open_source(source, deadline)?;
        let format = io_utils::detect_format(&mut stream, &source.key, self.config.delimiter, configured)?;
        debug!(
            "Reading {} as {} with delimiter {:?}",
            source.key,
            format.encoding.name(),
            char::from(format.delimiter)
        );
        let mut reader = io_utils::open_csv_reader(stream, format.delimiter, true);
        let inferer = SchemaInferer::new(self.config.typing, self.config.sample_rows);
        let (schema, stats) = inferer.infer(&mut reader, format.encoding)?;
        Ok((format, schema, stats))
    }

    fn plan(&self, source: SourceObject, table: TableName, schema: ColumnSchema) -> ConversionJob {
        let token = source.token();
        let table_prefix = self.output_key(&format!("{}/", table.table));
        let (data_prefix, partition_value) = match self.config.load_mode {
            LoadMode::Overwrite => (format!("{table_prefix}snapshot={token}/"), None),
            LoadMode::Incremental => {
                let value = match &table.discriminator {
                    Some(discriminator) => format!("{discriminator}_{token}"),
                    None => token,
                };
                (
                    format!("{table_prefix}{INGEST_BATCH_KEY}={value}/"),
                    Some(value),
                )
            }
        };
        ConversionJob {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            table,
            database: self.config.target_database.clone(),
            load_mode: self.config.load_mode,
            typing: self.config.typing,
            schema,
            target: TargetLocation {
                bucket: self.config.output_bucket.clone(),
                table_prefix,
                data_prefix,
                partition_value,
            },
        }
    }

    fn output_key(&self, relative: &str) -> String {
        match self.config.normalized_prefix() {
            "" => relative.to_string(),
            prefix => format!("{prefix}/{relative}"),
        }
    }

    fn encode(
        &self,
        job: &ConversionJob,
        format: &SourceFormat,
        deadline: Deadline,
    ) -> LoaderResult<StagedOutput> {
        let stream = self.open_source(&job.source, deadline)?;
        let mut reader = io_utils::open_csv_reader(stream, format.delimiter, true);
        io_utils::reader_headers(&mut reader, format.encoding)?;
        let staging_prefix = self.output_key(&format!("{STAGING_DIR}/{}/", job.id));
        let settings = EncoderSettings {
            batch_rows: self.config.batch_rows,
            max_rows_per_file: self.config.max_rows_per_file,
        };
        ColumnarEncoder::new(self.store.as_ref(), settings).encode(
            &mut reader,
            format.encoding,
            &job.schema,
            &job.target.bucket,
            &staging_prefix,
            deadline,
        )
    }

    /// Publishes the staged files and reconciles the catalog under the table
    /// lock.
    fn commit(
        &self,
        job: &ConversionJob,
        staged: &StagedOutput,
        based_on_version: Option<u64>,
        deadline: Deadline,
    ) -> LoaderResult<ReconcileOutcome> {
        let guard = self
            .reconciler
            .lock(&job.database, &job.table.table, deadline)?;
        let result = self.commit_locked(&guard, job, staged, based_on_version, deadline);
        if let Err(err) = guard.release() {
            warn!("Could not release lock on {}: {err}", job.qualified_table());
        }
        result
    }

    fn commit_locked(
        &self,
        guard: &TableLockGuard,
        job: &ConversionJob,
        staged: &StagedOutput,
        based_on_version: Option<u64>,
        deadline: Deadline,
    ) -> LoaderResult<ReconcileOutcome> {
        deadline.check("publish")?;
        guard.ensure_live()?;
        let applied = staged
            .publish(self.store.as_ref(), &job.target.data_prefix)
            .and_then(|published| {
                info!(
                    "Published {} file(s) to {}",
                    published.len(),
                    job.target.data_uri()
                );
                let target = CatalogTarget::for_job(job, based_on_version);
                self.reconciler.apply(guard, &target, job.load_mode, deadline)
            });
        let (outcome, _) = match applied {
            Ok(applied) => applied,
            Err(err) => {
                self.retract(job);
                return Err(err);
            }
        };

        if job.load_mode == LoadMode::Overwrite {
            self.clear_superseded(job);
        }
        Ok(outcome)
    }

    /// Removes published data after a failed commit unless the catalog ended
    /// up pointing at it anyway.
    fn retract(&self, job: &ConversionJob) {
        let target = &job.target;
        let location = target.data_uri();
        match self
            .reconciler
            .catalog()
            .get_table(&job.database, &job.table.table)
        {
            Ok(Some(record)) if record.references(&location) => {
                debug!("Keeping {location}: {} references it", record.qualified_name());
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("Could not check whether {location} is registered, keeping it: {err}");
                return;
            }
        }
        match self.store.delete_prefix(&target.bucket, &target.data_prefix) {
            Ok(removed) => info!("Removed {removed} unregistered object(s) at {location}"),
            Err(err) => warn!("Could not remove unregistered data at {location}: {err}"),
        }
    }

    /// Removes every object under the table prefix outside the new snapshot.
    /// The catalog no longer points at them, so failures only leave orphans.
    fn clear_superseded(&self, job: &ConversionJob) {
        let target = &job.target;
        let keys = match self.store.list(&target.bucket, &target.table_prefix) {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Could not list {} for cleanup: {err}", target.table_uri());
                return;
            }
        };
        let mut removed = 0usize;
        for key in keys.iter().filter(|key| !key.starts_with(&target.data_prefix)) {
            match self.store.delete(&target.bucket, key) {
                Ok(()) => removed += 1,
                Err(err) => warn!("Could not delete superseded object {key}: {err}"),
            }
        }
        if removed > 0 {
            info!("Removed {removed} superseded object(s) from {}", target.table_uri());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::MemoryCatalog,
        config::{TableNamingStrategy, TypingPolicy},
        storage::LocalObjectStore,
    };
    use crate::catalog::{CatalogApiError, CatalogResult, Lease, PartitionEntry, TableRecord};
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    /// Delegates to a [`MemoryCatalog`] but fails table writes while
    /// `unavailable` is set.
    struct FlakyCatalog {
        inner: MemoryCatalog,
        unavailable: AtomicBool,
    }

    impl FlakyCatalog {
        fn check(&self) -> CatalogResult<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CatalogApiError::Unavailable("write rejected".to_string()));
            }
            Ok(())
        }
    }

    impl Catalog for FlakyCatalog {
        fn create_database(&self, name: &str) -> CatalogResult<bool> {
            self.inner.create_database(name)
        }

        fn get_table(&self, database: &str, table: &str) -> CatalogResult<Option<TableRecord>> {
            self.inner.get_table(database, table)
        }

        fn create_table(&self, record: TableRecord) -> CatalogResult<TableRecord> {
            self.check()?;
            self.inner.create_table(record)
        }

        fn replace_table(
            &self,
            record: TableRecord,
            expected_version: u64,
        ) -> CatalogResult<TableRecord> {
            self.check()?;
            self.inner.replace_table(record, expected_version)
        }

        fn add_partition(
            &self,
            database: &str,
            table: &str,
            partition: PartitionEntry,
            expected_version: u64,
        ) -> CatalogResult<TableRecord> {
            self.check()?;
            self.inner
                .add_partition(database, table, partition, expected_version)
        }

        fn list_tables(&self, database: &str) -> CatalogResult<Vec<String>> {
            self.inner.list_tables(database)
        }

        fn try_acquire_lease(
            &self,
            database: &str,
            table: &str,
            holder_id: &str,
            ttl: Duration,
        ) -> CatalogResult<Lease> {
            self.inner.try_acquire_lease(database, table, holder_id, ttl)
        }

        fn release_lease(&self, database: &str, table: &str, holder_id: &str) -> CatalogResult<()> {
            self.inner.release_lease(database, table, holder_id)
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<LocalObjectStore>,
        catalog: Arc<MemoryCatalog>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(LocalObjectStore::new(dir.path()));
            Fixture {
                _dir: dir,
                store,
                catalog: Arc::new(MemoryCatalog::new()),
            }
        }

        fn upload(&self, key: &str, contents: &str) -> WorkflowInput {
            self.store.put("raw", key, contents.as_bytes()).unwrap();
            WorkflowInput::new("raw", key)
        }

        fn engine(&self, config: LoaderConfig) -> ConversionEngine {
            ConversionEngine::new(config, self.store.clone(), self.catalog.clone())
        }

        fn keys(&self) -> Vec<String> {
            self.store.list("lake", "").unwrap()
        }
    }

    fn config(mode: LoadMode) -> LoaderConfig {
        let mut config = LoaderConfig::new(mode, "sales", "lake");
        config.lock_wait = Duration::from_secs(5);
        config
    }

    #[test]
    fn overwrite_creates_table_and_snapshot() {
        let fx = Fixture::new();
        let input = fx.upload("orders.csv", "id,name\n1,a\n2,b\n");
        let result = fx.engine(config(LoadMode::Overwrite)).run(&input, Deadline::none());
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.table_name.as_deref(), Some("orders"));
        assert_eq!(result.rows_processed, 2);
        assert_eq!(result.catalog_action.as_deref(), Some("created"));

        let record = fx.catalog.get_table("sales", "orders").unwrap().unwrap();
        assert!(record.location.starts_with("s3://lake/orders/snapshot="));
        let keys = fx.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("/part-00000.parquet"));
        assert_eq!(format!("s3://lake/{}", keys[0]), format!("{}part-00000.parquet", record.location));
    }

    #[test]
    fn overwrite_with_new_content_clears_the_old_snapshot() {
        let fx = Fixture::new();
        let engine = fx.engine(config(LoadMode::Overwrite));
        let first = fx.upload("orders.csv", "id,amount\n1,2\n");
        assert!(engine.run(&first, Deadline::none()).is_success());
        let second = fx.upload("orders.csv", "id,total\n1,2\n2,3\n");
        let result = engine.run(&second, Deadline::none());
        assert_eq!(result.catalog_action.as_deref(), Some("replaced"));

        let record = fx.catalog.get_table("sales", "orders").unwrap().unwrap();
        assert_eq!(record.columns.names(), vec!["id", "total"]);
        let keys = fx.keys();
        assert_eq!(keys.len(), 1);
        assert!(record.location.ends_with(&keys[0].replace("part-00000.parquet", "")));
    }

    #[test]
    fn incremental_partition_carries_discriminator() {
        let fx = Fixture::new();
        let config = config(LoadMode::Incremental)
            .with_naming(TableNamingStrategy::SplitAtLastUnderscore)
            .with_output_prefix("/warehouse/");
        let input = fx.upload("orders_2024.csv", "id\n1\n");
        let result = fx.engine(config).run(&input, Deadline::none());
        assert!(result.is_success(), "{result:?}");

        let record = fx.catalog.get_table("sales", "orders").unwrap().unwrap();
        assert_eq!(record.location, "s3://lake/warehouse/orders/");
        assert_eq!(record.partitions.len(), 1);
        let partition = &record.partitions[0];
        assert!(partition.values[0].starts_with("2024_"));
        assert_eq!(partition.discriminator.as_deref(), Some("2024"));
        assert_eq!(partition.source, "s3://raw/orders_2024.csv");
        assert!(fx.keys()[0].starts_with("warehouse/orders/ingest_batch=2024_"));
    }

    #[test]
    fn typed_incremental_into_text_table_is_stored_as_text() {
        let fx = Fixture::new();
        let text = fx.upload("codes.csv", "code\nA1\n");
        assert!(fx.engine(config(LoadMode::Incremental)).run(&text, Deadline::none()).is_success());
        let typed_config = config(LoadMode::Incremental).with_typing(TypingPolicy::TYPED);
        let numbers = fx.upload("codes.csv", "code\n17\n18\n");
        let result = fx.engine(typed_config).run(&numbers, Deadline::none());
        assert_eq!(result.catalog_action.as_deref(), Some("extended"), "{result:?}");
        let record = fx.catalog.get_table("sales", "codes").unwrap().unwrap();
        assert_eq!(record.columns.columns[0].data_type, crate::schema::ColumnType::Text);
    }

    #[test]
    fn missing_source_is_reported_terminal() {
        let fx = Fixture::new();
        let result = fx
            .engine(config(LoadMode::Overwrite))
            .run(&WorkflowInput::new("raw", "absent.csv"), Deadline::none());
        let error = result.error.unwrap();
        assert_eq!(error.kind, "SourceNotFound");
        assert!(!error.retryable);
        assert_eq!(result.table_name.as_deref(), Some("absent"));
    }

    #[test]
    fn schema_errors_leave_no_files_and_no_table() {
        let fx = Fixture::new();
        let input = fx.upload("broken.csv", "a,b\n1,2\n3\n");
        let result = fx.engine(config(LoadMode::Overwrite)).run(&input, Deadline::none());
        assert_eq!(result.error.unwrap().kind, "SchemaError");
        assert!(fx.keys().is_empty());
        assert!(fx.catalog.get_table("sales", "broken").unwrap().is_none());
    }

    #[test]
    fn expired_deadline_fails_retryable_before_any_write() {
        let fx = Fixture::new();
        let input = fx.upload("orders.csv", "id\n1\n");
        let result = fx.engine(config(LoadMode::Overwrite)).run(&input, Deadline::expired());
        let error = result.error.unwrap();
        assert_eq!(error.kind, "DeadlineExceeded");
        assert!(error.retryable);
        assert!(fx.keys().is_empty());
    }

    #[test]
    fn lock_timeout_discards_staged_files() {
        let fx = Fixture::new();
        let input = fx.upload("orders.csv", "id\n1\n");
        let mut config = config(LoadMode::Overwrite);
        config.lock_wait = Duration::from_millis(150);
        let engine = fx.engine(config);
        let _held = engine
            .reconciler
            .lock("sales", "orders", Deadline::none())
            .unwrap();
        let result = engine.run(&input, Deadline::none());
        assert_eq!(result.error.unwrap().kind, "CatalogLockTimeoutError");
        assert!(fx.keys().is_empty());
    }

    #[test]
    fn rejected_catalog_writes_remove_the_published_snapshot() {
        let fx = Fixture::new();
        let catalog = Arc::new(FlakyCatalog {
            inner: MemoryCatalog::new(),
            unavailable: AtomicBool::new(false),
        });
        let engine = ConversionEngine::new(config(LoadMode::Overwrite), fx.store.clone(), catalog.clone());
        let first = fx.upload("orders.csv", "id\n1\n");
        assert!(engine.run(&first, Deadline::none()).is_success());
        let before = fx.keys();
        let location = catalog.get_table("sales", "orders").unwrap().unwrap().location;

        catalog.unavailable.store(true, Ordering::SeqCst);
        let second = fx.upload("orders.csv", "id\n1\n2\n");
        let result = engine.run(&second, Deadline::none());
        let error = result.error.unwrap();
        assert_eq!(error.kind, "TransientIoError");
        assert!(error.retryable);
        assert_eq!(fx.keys(), before);
        let record = catalog.get_table("sales", "orders").unwrap().unwrap();
        assert_eq!(record.location, location);
    }

    #[test]
    fn rejected_partition_leaves_no_batch_behind() {
        let fx = Fixture::new();
        let catalog = Arc::new(FlakyCatalog {
            inner: MemoryCatalog::new(),
            unavailable: AtomicBool::new(true),
        });
        let engine = ConversionEngine::new(config(LoadMode::Incremental), fx.store.clone(), catalog.clone());
        let input = fx.upload("events.csv", "id\n1\n");
        let result = engine.run(&input, Deadline::none());
        assert!(!result.is_success());
        assert!(fx.keys().is_empty(), "{:?}", fx.keys());
        assert!(catalog.get_table("sales", "events").unwrap().is_none());
    }
}
