//! Deployment configuration for the conversion engine.
//!
//! [`LoaderConfig`] is resolved once (YAML file, then environment, then CLI
//! overrides) and handed to [`crate::engine::ConversionEngine`] at
//! construction. The engine never reads the environment itself.

use std::{collections::HashMap, fmt, fs::File, io::BufReader, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{LoaderError, LoaderResult},
    naming,
};

pub const DEFAULT_SAMPLE_ROWS: usize = 2000;
pub const DEFAULT_BATCH_ROWS: usize = 8192;
pub const DEFAULT_MAX_ROWS_PER_FILE: usize = 1_000_000;
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Incremental,
    Overwrite,
}

impl LoadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::Incremental => "incremental",
            LoadMode::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = LoaderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(LoadMode::Incremental),
            "overwrite" => Ok(LoadMode::Overwrite),
            other => Err(LoaderError::Config(format!(
                "load_mode must be 'incremental' or 'overwrite', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableNamingStrategy {
    #[default]
    #[serde(rename = "use_full_filename")]
    FullFilename,
    #[serde(rename = "split_at_last_underscore")]
    SplitAtLastUnderscore,
}

impl TableNamingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            TableNamingStrategy::FullFilename => "use_full_filename",
            TableNamingStrategy::SplitAtLastUnderscore => "split_at_last_underscore",
        }
    }
}

impl fmt::Display for TableNamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableNamingStrategy {
    type Err = LoaderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "use_full_filename" | "full_filename" => Ok(TableNamingStrategy::FullFilename),
            "split_at_last_underscore" => Ok(TableNamingStrategy::SplitAtLastUnderscore),
            other => Err(LoaderError::Config(format!(
                "Unknown table_naming strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPolicy {
    #[serde(default)]
    pub allow_type_conversions: bool,
}

impl TypingPolicy {
    pub const TEXT_ONLY: TypingPolicy = TypingPolicy {
        allow_type_conversions: false,
    };
    pub const TYPED: TypingPolicy = TypingPolicy {
        allow_type_conversions: true,
    };
}

/// Fully resolved settings for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub load_mode: LoadMode,
    pub table_naming: TableNamingStrategy,
    pub typing: TypingPolicy,
    pub target_database: String,
    pub output_bucket: String,
    pub output_prefix: String,
    pub sample_rows: usize,
    pub encoding: Option<String>,
    pub delimiter: Option<u8>,
    pub batch_rows: usize,
    pub max_rows_per_file: usize,
    pub lock_wait: Duration,
    pub lock_ttl: Duration,
}

impl LoaderConfig {
    /// Builds a configuration with defaults for everything except the
    /// required settings.
    pub fn new(
        load_mode: LoadMode,
        target_database: impl Into<String>,
        output_bucket: impl Into<String>,
    ) -> Self {
        LoaderConfig {
            load_mode,
            table_naming: TableNamingStrategy::default(),
            typing: TypingPolicy::default(),
            target_database: target_database.into(),
            output_bucket: output_bucket.into(),
            output_prefix: String::new(),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            encoding: None,
            delimiter: None,
            batch_rows: DEFAULT_BATCH_ROWS,
            max_rows_per_file: DEFAULT_MAX_ROWS_PER_FILE,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_naming(mut self, strategy: TableNamingStrategy) -> Self {
        self.table_naming = strategy;
        self
    }

    pub fn with_typing(mut self, typing: TypingPolicy) -> Self {
        self.typing = typing;
        self
    }

    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> LoaderResult<()> {
        if self.target_database.trim().is_empty() {
            return Err(LoaderError::Config("target_database is required".to_string()));
        }
        if !naming::is_catalog_identifier(&self.target_database) {
            return Err(LoaderError::Config(format!(
                "target_database '{}' must be lowercase alphanumerics/underscore starting with a letter",
                self.target_database
            )));
        }
        if self.output_bucket.trim().is_empty() {
            return Err(LoaderError::Config("output_bucket is required".to_string()));
        }
        if self.batch_rows == 0 {
            return Err(LoaderError::Config("batch_rows must be positive".to_string()));
        }
        if self.max_rows_per_file < self.batch_rows {
            return Err(LoaderError::Config(format!(
                "max_rows_per_file ({}) must be at least batch_rows ({})",
                self.max_rows_per_file, self.batch_rows
            )));
        }
        Ok(())
    }

    /// Output prefix without surrounding slashes; empty when unset.
    pub fn normalized_prefix(&self) -> &str {
        self.output_prefix.trim_matches('/')
    }
}

/// Partially specified configuration as read from a file, the environment or
/// the command line. Later layers override earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub load_mode: Option<LoadMode>,
    pub table_naming: Option<TableNamingStrategy>,
    pub allow_type_conversions: Option<bool>,
    pub target_database: Option<String>,
    pub output_bucket: Option<String>,
    pub output_prefix: Option<String>,
    pub sample_rows: Option<usize>,
    pub encoding: Option<String>,
    pub delimiter: Option<String>,
    pub batch_rows: Option<usize>,
    pub max_rows_per_file: Option<usize>,
    pub lock_wait_secs: Option<u64>,
    pub lock_ttl_secs: Option<u64>,
}

impl ConfigLayer {
    pub fn load(path: &Path) -> LoaderResult<Self> {
        let file = File::open(path)
            .map_err(|err| LoaderError::Config(format!("Opening config file {path:?}: {err}")))?;
        serde_yaml::from_reader(BufReader::new(file))
            .map_err(|err| LoaderError::Config(format!("Parsing config file {path:?}: {err}")))
    }

    /// Reads the recognised environment variables from `vars`.
    ///
    /// Takes the variables as a map so callers decide where they come from;
    /// the CLI passes `std::env::vars()`.
    pub fn from_env_map(vars: &HashMap<String, String>) -> LoaderResult<Self> {
        let get = |name: &str| {
            vars.get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };
        let mut layer = ConfigLayer::default();
        if let Some(value) = get("LOAD_MODE") {
            layer.load_mode = Some(value.parse()?);
        }
        if let Some(value) = get("TABLE_NAMING") {
            layer.table_naming = Some(value.parse()?);
        }
        if let Some(value) = get("ALLOW_TYPE_CONVERSION") {
            layer.allow_type_conversions = Some(env_bool(value));
        }
        layer.target_database = get("TARGET_DATABASE")
            .or_else(|| get("GLUE_DATABASE"))
            .map(str::to_string);
        layer.output_bucket = get("OUTPUT_BUCKET").map(str::to_string);
        layer.output_prefix = get("PARQUET_PREFIX").map(str::to_string);
        layer.encoding = get("CSV_ENCODING").map(str::to_string);
        if let Some(value) = get("SAMPLE_ROWS") {
            layer.sample_rows = Some(value.parse().map_err(|_| {
                LoaderError::Config(format!("SAMPLE_ROWS must be a number, got '{value}'"))
            })?);
        }
        Ok(layer)
    }

    pub fn merge(mut self, other: ConfigLayer) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            load_mode,
            table_naming,
            allow_type_conversions,
            target_database,
            output_bucket,
            output_prefix,
            sample_rows,
            encoding,
            delimiter,
            batch_rows,
            max_rows_per_file,
            lock_wait_secs,
            lock_ttl_secs,
        );
        self
    }

    pub fn resolve(self) -> LoaderResult<LoaderConfig> {
        let load_mode = self.load_mode.ok_or_else(|| {
            LoaderError::Config(
                "load_mode must be set explicitly ('incremental' or 'overwrite')".to_string(),
            )
        })?;
        let target_database = self
            .target_database
            .ok_or_else(|| LoaderError::Config("target_database is required".to_string()))?;
        let output_bucket = self
            .output_bucket
            .ok_or_else(|| LoaderError::Config("output_bucket is required".to_string()))?;
        let delimiter = self
            .delimiter
            .as_deref()
            .map(parse_delimiter)
            .transpose()
            .map_err(LoaderError::Config)?;

        let mut config = LoaderConfig::new(load_mode, target_database, output_bucket);
        config.table_naming = self.table_naming.unwrap_or_default();
        config.typing.allow_type_conversions = self.allow_type_conversions.unwrap_or(false);
        config.output_prefix = self.output_prefix.unwrap_or_default();
        config.sample_rows = self.sample_rows.unwrap_or(DEFAULT_SAMPLE_ROWS);
        config.encoding = self.encoding;
        config.delimiter = delimiter;
        config.batch_rows = self.batch_rows.unwrap_or(DEFAULT_BATCH_ROWS);
        config.max_rows_per_file = self.max_rows_per_file.unwrap_or(DEFAULT_MAX_ROWS_PER_FILE);
        if let Some(secs) = self.lock_wait_secs {
            config.lock_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = self.lock_ttl_secs {
            config.lock_ttl = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn env_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" | "\\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
