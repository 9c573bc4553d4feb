#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, StringArray};
use arrow::record_batch::RecordBatch;
use csv_lake::catalog::{Catalog, FileCatalog, TableRecord};
use csv_lake::config::{LoadMode, LoaderConfig};
use csv_lake::engine::ConversionEngine;
use csv_lake::job::WorkflowInput;
use csv_lake::storage::{LocalObjectStore, ObjectStore};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tempfile::{TempDir, tempdir};

pub const SOURCE_BUCKET: &str = "raw";
pub const OUTPUT_BUCKET: &str = "lake";
pub const DATABASE: &str = "sales";

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    pub fn store_root(&self) -> PathBuf {
        self.path().join("objects")
    }

    pub fn catalog_root(&self) -> PathBuf {
        self.path().join("catalog")
    }
}

/// Object store plus file catalog rooted in one scratch workspace.
pub struct Lake {
    pub workspace: TestWorkspace,
    pub store: Arc<LocalObjectStore>,
    pub catalog: Arc<FileCatalog>,
}

impl Lake {
    pub fn new() -> Self {
        let workspace = TestWorkspace::new();
        let store = Arc::new(LocalObjectStore::new(workspace.store_root()));
        let catalog = Arc::new(FileCatalog::new(workspace.catalog_root()));
        Lake {
            workspace,
            store,
            catalog,
        }
    }

    pub fn upload(&self, key: &str, contents: &[u8]) -> WorkflowInput {
        self.upload_to(SOURCE_BUCKET, key, contents)
    }

    pub fn upload_to(&self, bucket: &str, key: &str, contents: &[u8]) -> WorkflowInput {
        self.store
            .put(bucket, key, contents)
            .expect("upload source object");
        WorkflowInput::new(bucket, key)
    }

    pub fn engine(&self, config: LoaderConfig) -> ConversionEngine {
        ConversionEngine::new(config, self.store.clone(), self.catalog.clone())
    }

    pub fn table(&self, name: &str) -> Option<TableRecord> {
        self.catalog.get_table(DATABASE, name).expect("read table")
    }

    /// Keys in the output bucket, sorted.
    pub fn output_keys(&self) -> Vec<String> {
        self.store.list(OUTPUT_BUCKET, "").expect("list output")
    }

    pub fn read_parquet(&self, key: &str) -> Vec<RecordBatch> {
        let path = self.store.root().join(OUTPUT_BUCKET).join(key);
        let file = File::open(&path).expect("open parquet file");
        ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("parquet metadata")
            .build()
            .expect("parquet reader")
            .map(|batch| batch.expect("record batch"))
            .collect()
    }

    /// All batches of every file under `prefix`.
    pub fn read_prefix(&self, prefix: &str) -> Vec<RecordBatch> {
        self.store
            .list(OUTPUT_BUCKET, prefix)
            .expect("list prefix")
            .iter()
            .flat_map(|key| self.read_parquet(key))
            .collect()
    }
}

pub fn config(mode: LoadMode) -> LoaderConfig {
    LoaderConfig::new(mode, DATABASE, OUTPUT_BUCKET)
}

/// Object key of a catalog location (`s3://lake/<prefix>`).
pub fn location_prefix(location: &str) -> String {
    location
        .strip_prefix(&format!("s3://{OUTPUT_BUCKET}/"))
        .expect("location in output bucket")
        .to_string()
}

pub fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

/// Values of a text column across batches; nulls as `None`.
pub fn text_column(batches: &[RecordBatch], index: usize) -> Vec<Option<String>> {
    batches
        .iter()
        .flat_map(|batch| {
            let array = batch
                .column(index)
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("utf8 column");
            (0..array.len())
                .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}
