pub mod catalog;
pub mod cli;
pub mod config;
pub mod data;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod io_utils;
pub mod job;
pub mod naming;
pub mod schema;
pub mod storage;
pub mod trigger;

use std::{
    collections::HashMap,
    env,
    fs::File,
    io::{BufReader, Read},
    path::Path,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};
use serde_json::json;

use crate::{
    catalog::{Catalog, FileCatalog},
    cli::{BackendArgs, Cli, Commands, ConfigArgs},
    config::{ConfigLayer, LoaderConfig, TypingPolicy},
    engine::ConversionEngine,
    job::{Deadline, WorkflowInput},
    schema::SchemaInferer,
    storage::LocalObjectStore,
    trigger::{InlineWorkflowStarter, TriggerAdapter},
};

static LOGGER: OnceLock<()> = OnceLock::new();

pub fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_lake", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Convert(args) => handle_convert(&args),
        Commands::Trigger(args) => handle_trigger(&args),
        Commands::Probe(args) => handle_probe(&args),
        Commands::Show(args) => handle_show(&args),
    }
}

/// Config file, then environment, then command-line flags.
fn resolve_config(args: &ConfigArgs) -> Result<LoaderConfig> {
    let mut layer = match &args.config {
        Some(path) => ConfigLayer::load(path)?,
        None => ConfigLayer::default(),
    };
    let vars: HashMap<String, String> = env::vars().collect();
    layer = layer
        .merge(ConfigLayer::from_env_map(&vars)?)
        .merge(args.layer());
    let config = layer.resolve()?;
    debug!("Resolved configuration: {config:?}");
    Ok(config)
}

fn build_engine(backend: &BackendArgs, config: &ConfigArgs) -> Result<ConversionEngine> {
    let config = resolve_config(config)?;
    let store = Arc::new(LocalObjectStore::new(&backend.store_root));
    let catalog = Arc::new(FileCatalog::new(&backend.catalog_root));
    Ok(ConversionEngine::new(config, store, catalog))
}

fn deadline(timeout_secs: Option<u64>) -> Deadline {
    timeout_secs.map_or_else(Deadline::none, |secs| {
        Deadline::after(Duration::from_secs(secs))
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
    serde_json::from_reader(BufReader::new(file)).with_context(|| format!("Parsing {path:?}"))
}

fn handle_convert(args: &cli::ConvertArgs) -> Result<()> {
    let input = match (&args.input, &args.bucket, &args.key) {
        (Some(path), _, _) => read_json::<WorkflowInput>(path)?,
        (None, Some(bucket), Some(key)) => WorkflowInput::new(bucket, key),
        _ => bail!("either --input or both --bucket and --key are required"),
    };
    let engine = build_engine(&args.backend, &args.config)?;
    let result = engine.run(&input, deadline(args.timeout_secs));
    println!("{}", serde_json::to_string_pretty(&result)?);
    match &result.error {
        None => Ok(()),
        Some(error) => Err(anyhow!(
            "conversion of {} failed with {}",
            input.source,
            error.kind
        )),
    }
}

fn handle_trigger(args: &cli::TriggerArgs) -> Result<()> {
    let mut event = String::new();
    File::open(&args.event)
        .and_then(|mut file| file.read_to_string(&mut event))
        .with_context(|| format!("Reading upload notification {:?}", args.event))?;

    let engine = Arc::new(build_engine(&args.backend, &args.config)?);
    let mut starter = InlineWorkflowStarter::new(engine);
    if let Some(secs) = args.timeout_secs {
        starter = starter.with_timeout(Duration::from_secs(secs));
    }
    let starter = Arc::new(starter);
    let adapter = TriggerAdapter::new(starter.clone());
    let started = adapter
        .handle_event(&event)
        .with_context(|| format!("Handling upload notification {:?}", args.event))?;
    info!("Started {} execution(s)", started.len());

    let mut failed = 0usize;
    let report: Vec<_> = started
        .iter()
        .map(|execution| {
            let result = starter
                .execution(&execution.name)
                .and_then(|record| record.result);
            if result.as_ref().is_some_and(|result| !result.is_success()) {
                failed += 1;
            }
            json!({ "execution": execution, "result": result })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if failed > 0 {
        bail!("{failed} execution(s) failed");
    }
    Ok(())
}

fn handle_probe(args: &cli::ProbeArgs) -> Result<()> {
    let typing = if args.allow_type_conversions {
        TypingPolicy::TYPED
    } else {
        TypingPolicy::TEXT_ONLY
    };
    let configured = io_utils::resolve_encoding(args.encoding.as_deref())?;
    let file = File::open(&args.input).with_context(|| format!("Opening {:?}", args.input))?;
    let mut stream = BufReader::new(file);
    let key = args.input.to_string_lossy();
    let format = io_utils::detect_format(&mut stream, &key, args.delimiter, configured)?;
    info!(
        "Probing '{}' as {} with delimiter '{}'",
        args.input.display(),
        format.encoding.name(),
        printable_delimiter(format.delimiter)
    );
    let mut reader = io_utils::open_csv_reader(stream, format.delimiter, true);
    let (schema, stats) = SchemaInferer::new(typing, args.sample_rows)
        .infer(&mut reader, format.encoding)
        .with_context(|| format!("Inferring schema from {:?}", args.input))?;
    let report = json!({
        "columns": schema,
        "rows_sampled": stats.rows_sampled,
        "full_scan": stats.full_scan,
        "delimiter": printable_delimiter(format.delimiter),
        "encoding": format.encoding.name(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_show(args: &cli::ShowArgs) -> Result<()> {
    let (database, table) = args
        .table
        .split_once('.')
        .ok_or_else(|| anyhow!("expected database.table, got '{}'", args.table))?;
    let catalog = FileCatalog::new(&args.catalog_root);
    let record = catalog
        .get_table(database, table)
        .with_context(|| format!("Reading catalog entry for {}", args.table))?
        .ok_or_else(|| anyhow!("table {} is not registered", args.table))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        other => (other as char).to_string(),
    }
}
