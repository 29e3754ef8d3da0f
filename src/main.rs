//! Command-line driver for the OpenEIS ingestion and query engine.
//!
//! This binary orchestrates the full run sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Validating a sensor map and ingesting CSV files into the column store
//! - Optionally committing a filtered dataset
//! - Running an analysis application into CSV files or dynamic tables
//! - Persisting datasets and analyses to PostgreSQL when configured
//!
//! # Environment Variables
//! - `DATABASE_URL` (optional) – PostgreSQL connection string
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `OPENEIS_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `OPENEIS_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`openeis_core::config`] for the remaining variables.
use std::{
    env,
    fs::{self, File},
    io::IsTerminal,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use indexmap::IndexMap;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use openeis_core::analysis::{Analysis, AnalysisConfig, AnalysisDriver, AnalysisStatus};
use openeis_core::filters::{FilterEntry, FilterPipeline};
use openeis_core::ingest::{run_ingest, CancelToken};
use openeis_core::output::{CsvOutput, OutputTables, TableOutput};
use openeis_core::{apps, db, schema, Catalog, Config, DataStore, IngestId, SensorMap, SensorMapId};

// ---

#[derive(Debug, Parser)]
#[command(name = "openeis", version, about = "Sensor-data ingestion and analysis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a sensor map and print every problem found
    Validate {
        /// Sensor map JSON document
        map: PathBuf,
    },
    /// Ingest CSV files under a sensor map and print the ingest log
    Ingest(IngestArgs),
    /// Ingest CSV files, then run an application over the dataset
    Run {
        #[command(flatten)]
        input: IngestArgs,

        /// Application name, see `openeis apps`
        #[arg(long)]
        app: String,

        /// Analysis configuration: {"parameters": {..}, "inputs": {..}}
        #[arg(long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = SinkKind::Csv)]
        sink: SinkKind,

        /// Overrides OPENEIS_OUTPUT_DIR
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// List the built-in applications with their inputs and options
    Apps,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Sensor map JSON document
    #[arg(long)]
    map: PathBuf,

    /// Upload bound to a sensor map file, as KEY=PATH
    #[arg(long = "file", value_parser = parse_binding, required = true)]
    files: Vec<(String, PathBuf)>,

    /// Dataset name
    #[arg(long, default_value = "upload")]
    name: String,

    /// Filter entries (JSON list) committed as a new dataset after ingest
    #[arg(long)]
    filters: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    Csv,
    Database,
}

fn parse_binding(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => Ok((key.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected KEY=PATH, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = openeis_core::config::load_from_env()?;
    cfg.log_config();

    match cli.command {
        Command::Validate { map } => validate(&map),
        Command::Apps => list_apps(),
        Command::Ingest(input) => {
            let pool = connect(&cfg).await?;
            let dataset = ingest(&cfg, &input).await?;
            if let Some(pool) = &pool {
                db::store_ingest(pool, &dataset.store, dataset.ingest_id).await?;
            }
            Ok(())
        }
        Command::Run {
            input,
            app,
            config,
            sink,
            output_dir,
        } => {
            let pool = connect(&cfg).await?;
            let dataset = ingest(&cfg, &input).await?;
            let config: AnalysisConfig = serde_json::from_str(&fs::read_to_string(&config)?)
                .with_context(|| format!("reading analysis configuration {}", config.display()))?;
            let output_dir = output_dir.unwrap_or_else(|| cfg.output_dir.clone());
            run_analysis(&cfg, pool.as_ref(), dataset, &app, config, sink, output_dir).await
        }
    }
}

// ---

/// Connect and create the schema when `DATABASE_URL` is set.
async fn connect(cfg: &Config) -> Result<Option<PgPool>> {
    // ---
    let Some(db_url) = &cfg.db_url else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(db_url)
        .await
        .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;
    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;
    Ok(Some(pool))
}

fn read_map(path: &Path) -> Result<SensorMap> {
    // ---
    let text = fs::read_to_string(path).with_context(|| format!("reading sensor map {}", path.display()))?;
    SensorMap::from_json_str(&text, Catalog::builtin()).map_err(|errors| anyhow!("invalid sensor map: {errors}"))
}

fn validate(path: &Path) -> Result<()> {
    // ---
    let text = fs::read_to_string(path).with_context(|| format!("reading sensor map {}", path.display()))?;
    let errors = match SensorMap::from_json_str(&text, Catalog::builtin()) {
        Ok(_) => {
            println!("{}", json!({"valid": true}));
            return Ok(());
        }
        Err(errors) => errors,
    };

    let report: serde_json::Map<String, serde_json::Value> = errors
        .iter()
        .map(|(path, messages)| {
            let rendered: Vec<String> = path.iter().map(ToString::to_string).collect();
            (format!("[{}]", rendered.join(", ")), json!(messages))
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&json!({"valid": false, "errors": report}))?);
    Err(anyhow!("sensor map has {} problem(s)", errors.len()))
}

fn list_apps() -> Result<()> {
    // ---
    let registry = apps::registry();
    let mut listing = Vec::new();
    for name in registry.names() {
        if let Some(factory) = registry.get(name) {
            listing.push(json!({
                "name": name,
                "inputs": factory.required_input(),
                "parameters": factory.get_config_parameters(),
            }));
        }
    }
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

struct Dataset {
    store: Arc<DataStore>,
    map_id: SensorMapId,
    ingest_id: IngestId,
}

async fn ingest(cfg: &Config, args: &IngestArgs) -> Result<Dataset> {
    // ---
    let catalog = Catalog::builtin();
    let map = read_map(&args.map)?;
    let store = DataStore::new();
    let map_id = store.create_sensor_map(cfg.project_id, &args.name, map, catalog)?;

    let mut names = IndexMap::new();
    let mut streams = IndexMap::new();
    for (key, path) in &args.files {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        names.insert(key.clone(), path.display().to_string());
        streams.insert(key.clone(), file);
    }
    let ingest_id = store.create_ingest(map_id, &args.name, names)?;

    let cancel = CancelToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling ingest");
                cancel.cancel();
            }
        })
    };
    let options = cfg.sniffer_options();
    let worker_store = store.clone();
    let log = tokio::task::spawn_blocking(move || {
        run_ingest(&worker_store, ingest_id, streams, catalog, &options, &cancel)
    })
    .await?;
    watcher.abort();
    let log = log?;

    println!("{}", serde_json::to_string_pretty(&json!({"ingest": ingest_id, "log": log}))?);
    if store.ingest(ingest_id)?.status != openeis_core::store::IngestStatus::Complete {
        return Err(anyhow!("no file of ingest {ingest_id} could be stored"));
    }

    let Some(filters) = &args.filters else {
        return Ok(Dataset { store, map_id, ingest_id });
    };
    let entries: Vec<FilterEntry> = serde_json::from_str(&fs::read_to_string(filters)?)
        .with_context(|| format!("reading filters {}", filters.display()))?;
    let pipeline = FilterPipeline::build(&store, map_id, vec![ingest_id], &entries)?;
    if let Some(first) = pipeline.errors().first() {
        for error in pipeline.errors() {
            tracing::error!(%error, "filter entry rejected");
        }
        return Err(anyhow!("{} filter entries rejected, first: {first}", pipeline.errors().len()));
    }
    let (map_id, ingest_id) = pipeline.commit(&store, catalog, &format!("{} (filtered)", args.name))?;
    Ok(Dataset { store, map_id, ingest_id })
}

async fn run_analysis(
    cfg: &Config,
    pool: Option<&PgPool>,
    dataset: Dataset,
    app: &str,
    config: AnalysisConfig,
    sink: SinkKind,
    output_dir: PathBuf,
) -> Result<()> {
    // ---
    let Dataset {
        store,
        map_id,
        ingest_id,
    } = dataset;
    let mut analysis = Analysis::new(cfg.project_id, app, app, map_id, vec![ingest_id], config);
    let driver = AnalysisDriver::new(store.clone(), apps::registry());

    let (analysis, tables) = match sink {
        SinkKind::Csv => {
            let mut out = CsvOutput::new(&output_dir, analysis.id);
            let dir = out.dir().to_path_buf();
            let analysis = tokio::task::spawn_blocking(move || {
                if let Err(error) = driver.run(&mut analysis, &mut out) {
                    tracing::error!(%error, "analysis run failed");
                }
                analysis
            })
            .await?;
            tracing::info!(dir = %dir.display(), "wrote analysis output");
            (analysis, None)
        }
        SinkKind::Database => {
            let tables = OutputTables::new();
            let mut out = TableOutput::new(tables.clone(), cfg.project_id, analysis.id);
            let (analysis, logs) = tokio::task::spawn_blocking(move || {
                if let Err(error) = driver.run(&mut analysis, &mut out) {
                    tracing::error!(%error, "analysis run failed");
                }
                (analysis, out.logs().to_vec())
            })
            .await?;
            (analysis, Some((tables, logs)))
        }
    };

    match (pool, &tables) {
        (Some(pool), Some((tables, logs))) => {
            let stored = db::store_ingest(pool, &store, ingest_id).await?;
            db::store_analysis(pool, &analysis, Some(stored.map_id), tables, logs).await?;
        }
        (None, Some(_)) => tracing::warn!("DATABASE_URL is not set, output tables were not persisted"),
        _ => {}
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "analysis": analysis.id,
            "status": analysis.status,
            "progress": analysis.progress,
            "message": analysis.message,
        }))?
    );
    if analysis.status != AnalysisStatus::Complete {
        return Err(anyhow!(
            "analysis failed: {}",
            analysis.message.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `OPENEIS_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `OPENEIS_LOG_LEVEL` env var
///
/// Logs go to stderr so stdout carries only command results.
fn init_tracing() {
    // ---
    let span_events = match env::var("OPENEIS_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to OPENEIS_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("OPENEIS_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
