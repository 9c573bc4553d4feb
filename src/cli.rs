use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{ConfigLayer, LoadMode, TableNamingStrategy, parse_delimiter};

#[derive(Debug, Parser)]
#[command(author, version, about = "Convert uploaded CSV files into cataloged Parquet tables", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Convert one source object and reconcile its catalog entry
    Convert(ConvertArgs),
    /// Start conversions for the object-created records of an upload notification
    Trigger(TriggerArgs),
    /// Infer the schema of a local CSV file and print it as JSON
    Probe(ProbeArgs),
    /// Print the catalog entry of a table (`database.table`)
    Show(ShowArgs),
}

/// Where objects and catalog documents live on the local filesystem.
#[derive(Debug, Args)]
pub struct BackendArgs {
    /// Directory holding one sub-directory per bucket
    #[arg(long = "store-root")]
    pub store_root: PathBuf,
    /// Directory holding catalog databases
    #[arg(long = "catalog-root")]
    pub catalog_root: PathBuf,
}

/// Per-invocation overrides; they win over the config file and environment.
#[derive(Debug, Args, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Load mode: incremental or overwrite
    #[arg(long = "load-mode")]
    pub load_mode: Option<LoadMode>,
    /// Table naming: use_full_filename or split_at_last_underscore
    #[arg(long = "table-naming")]
    pub table_naming: Option<TableNamingStrategy>,
    /// Infer typed columns instead of storing everything as text
    #[arg(long = "allow-type-conversions")]
    pub allow_type_conversions: bool,
    /// Catalog database receiving the tables
    #[arg(long = "database")]
    pub database: Option<String>,
    /// Bucket receiving the Parquet files
    #[arg(long = "output-bucket")]
    pub output_bucket: Option<String>,
    /// Prefix prepended to every table prefix
    #[arg(long = "output-prefix")]
    pub output_prefix: Option<String>,
    /// Rows sampled for type inference (0 means full scan)
    #[arg(long = "sample-rows")]
    pub sample_rows: Option<usize>,
    /// Character encoding of the source files
    #[arg(long = "encoding")]
    pub encoding: Option<String>,
    /// Field delimiter (supports ',', 'tab', ';', '|'); sniffed when omitted
    #[arg(long = "delimiter")]
    pub delimiter: Option<String>,
    /// Rows per record batch
    #[arg(long = "batch-rows")]
    pub batch_rows: Option<usize>,
    /// Rows per Parquet file
    #[arg(long = "max-rows-per-file")]
    pub max_rows_per_file: Option<usize>,
    /// Seconds to wait for the table lock
    #[arg(long = "lock-wait-secs")]
    pub lock_wait_secs: Option<u64>,
    /// Seconds before an abandoned table lock may be taken over
    #[arg(long = "lock-ttl-secs")]
    pub lock_ttl_secs: Option<u64>,
}

impl ConfigArgs {
    pub fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            load_mode: self.load_mode,
            table_naming: self.table_naming,
            allow_type_conversions: self.allow_type_conversions.then_some(true),
            target_database: self.database.clone(),
            output_bucket: self.output_bucket.clone(),
            output_prefix: self.output_prefix.clone(),
            sample_rows: self.sample_rows,
            encoding: self.encoding.clone(),
            delimiter: self.delimiter.clone(),
            batch_rows: self.batch_rows,
            max_rows_per_file: self.max_rows_per_file,
            lock_wait_secs: self.lock_wait_secs,
            lock_ttl_secs: self.lock_ttl_secs,
        }
    }
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Bucket of the source object
    #[arg(long, requires = "key", conflicts_with = "input")]
    pub bucket: Option<String>,
    /// Key of the source object
    #[arg(long, requires = "bucket")]
    pub key: Option<String>,
    /// Workflow input document (`{"source": {"bucket": ..., "key": ...}}`)
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
    /// Fail the job once this many seconds have passed
    #[arg(long = "timeout-secs")]
    pub timeout_secs: Option<u64>,
    #[command(flatten)]
    pub backend: BackendArgs,
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct TriggerArgs {
    /// Upload notification document in the S3 event shape
    #[arg(short = 'e', long = "event")]
    pub event: PathBuf,
    /// Per-execution time limit in seconds
    #[arg(long = "timeout-secs")]
    pub timeout_secs: Option<u64>,
    #[command(flatten)]
    pub backend: BackendArgs,
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Input CSV file to inspect
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Infer typed columns instead of text
    #[arg(long = "allow-type-conversions")]
    pub allow_type_conversions: bool,
    /// Number of rows to sample when inferring types (0 means full scan)
    #[arg(long, default_value_t = crate::config::DEFAULT_SAMPLE_ROWS)]
    pub sample_rows: usize,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file
    #[arg(long = "encoding")]
    pub encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Qualified table name, `database.table`
    pub table: String,
    /// Directory holding catalog databases
    #[arg(long = "catalog-root")]
    pub catalog_root: PathBuf,
}
