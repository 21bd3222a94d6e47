//! Rollup TSDB maintenance CLI
//!
//! # Commands
//!
//! - `check-config` - Validate the configuration file and print a summary
//! - `ingest --file <path>` - Save metrics from a JSON-lines file
//! - `query ...` - Print aggregated metrics as JSON lines, newest bucket first
//!
//! # Configuration
//!
//! The configuration is read from `--config`, then `ROLLUP_CONFIG`, then
//! `./rollup.toml` if present, falling back to defaults. `ROLLUP_*` environment
//! variables override file values.
//!
//! # Example Usage
//!
//! ```bash
//! rollup-cli --config /etc/rollup.toml check-config
//!
//! # {"timestamp":1700000000000,"group":"web","type":"latency","name":"p99","value":12}
//! rollup-cli ingest --file samples.jsonl
//!
//! rollup-cli query --start 2023-11-14T00:00:00Z --end 1700000000000 \
//!     --group web --type latency --unit hours --auths ops,admin
//! ```

use chrono::DateTime;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use rollup_tsdb::{
    config::{init_tracing, BackendKind, RollupConfig},
    redis::util::sanitize_url,
    types::{Metric, MetricTimeUnit, Timestamp},
    Authorizations, MetricQuery, RollupMetricStore,
};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "rollup.toml";

#[derive(Parser)]
#[command(name = "rollup-cli")]
#[command(version)]
#[command(about = "Maintenance tool for the dual-indexed metric roll-up store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides ROLLUP_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and print a summary
    CheckConfig,

    /// Save metrics from a JSON-lines file
    Ingest {
        /// One JSON metric (or `null`) per line
        #[arg(short, long)]
        file: PathBuf,

        /// Metrics per save call
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
    },

    /// Query aggregated metrics
    Query {
        /// Window start: epoch millis or RFC 3339
        #[arg(long, value_parser = parse_time)]
        start: Timestamp,

        /// Window end: epoch millis or RFC 3339
        #[arg(long, value_parser = parse_time)]
        end: Timestamp,

        /// Metric group
        #[arg(long)]
        group: String,

        /// Metric type
        #[arg(long = "type")]
        metric_type: String,

        /// Metric name; all names in the group when omitted
        #[arg(long)]
        name: Option<String>,

        /// minutes, hours, days or months
        #[arg(long)]
        unit: Option<MetricTimeUnit>,

        /// Comma-separated authorization labels
        #[arg(long, default_value = "")]
        auths: String,

        /// Scan the group-index table instead of the type index
        #[arg(long)]
        by_group: bool,
    },
}

fn parse_time(value: &str) -> Result<Timestamp, String> {
    if let Ok(millis) = value.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("expected epoch millis or RFC 3339 time: {}", e))
}

fn load_config(path: Option<&Path>) -> rollup_tsdb::Result<RollupConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("ROLLUP_CONFIG").map(PathBuf::from))
        .or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });

    match path {
        Some(path) => RollupConfig::from_file_with_env(path),
        None => RollupConfig::from_env(),
    }
}

async fn open_store(config: &RollupConfig) -> Result<RollupMetricStore, Box<dyn std::error::Error>> {
    if config.backend.kind == BackendKind::Memory {
        return Err("the memory backend does not persist between runs; configure kind = \"redis\"".into());
    }
    Ok(RollupMetricStore::from_config(config).await?)
}

/// Validate configuration and print summary
fn cmd_check_config(config: &RollupConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    println!("Configuration is valid!");
    println!();
    println!("Tables:");
    println!("  Group index: {}", config.table.name);
    println!("  Type index:  {}_reverse", config.table.name);
    println!();
    println!("Store Settings:");
    println!("  Max query threads: {}", config.store.max_query_threads);
    println!("  Max memory: {} bytes", config.store.max_memory);
    println!("  Max latency: {:?}", config.store.max_latency);
    println!("  Max write threads: {}", config.store.max_write_threads);
    println!();
    println!("Backend:");
    match config.backend.kind {
        BackendKind::Memory => println!("  Kind: memory"),
        BackendKind::Redis => {
            println!("  Kind: redis");
            println!("  URL: {}", sanitize_url(&config.backend.redis_url));
            println!("  Namespace: {}", config.backend.namespace);
            println!("  Pool size: {}", config.backend.pool_size);
        },
    }
    println!();
    println!("Log level: {}", config.logging.level);
    Ok(())
}

/// Save every metric in a JSON-lines file
async fn cmd_ingest(
    config: &RollupConfig,
    file: &Path,
    batch_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    if batch_size == 0 {
        return Err("--batch-size must be > 0".into());
    }
    let reader = BufReader::new(std::fs::File::open(file)?);
    let store = open_store(config).await?;

    let mut batch: Vec<Option<Metric>> = Vec::with_capacity(batch_size);
    let (mut saved, mut skipped) = (0usize, 0usize);

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let metric: Option<Metric> = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {}", file.display(), line_no + 1, e))?;
        if metric.is_none() {
            skipped += 1;
        }
        batch.push(metric);

        if batch.len() >= batch_size {
            saved += store.save(batch.drain(..)).await?;
        }
    }
    if !batch.is_empty() {
        saved += store.save(batch.drain(..)).await?;
    }
    store.shutdown().await?;

    info!(saved, skipped, file = %file.display(), "Ingest complete");
    println!("Saved {} metrics ({} null lines skipped)", saved, skipped);
    Ok(())
}

/// Print query results as JSON lines
async fn cmd_query(
    config: &RollupConfig,
    query: MetricQuery,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config).await?;
    let mut results = store.query(&query).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut count = 0usize;
    while let Some(metric) = results.try_next().await? {
        serde_json::to_writer(&mut out, &metric)?;
        writeln!(out)?;
        count += 1;
    }
    out.flush()?;

    if count == 0 {
        warn!(group = %query.group, metric_type = %query.metric_type, "Query returned no metrics");
    }
    store.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::Ingest { file, batch_size } => cmd_ingest(&config, &file, batch_size).await,
        Commands::Query {
            start,
            end,
            group,
            metric_type,
            name,
            unit,
            auths,
            by_group,
        } => {
            let mut query =
                MetricQuery::new(start, end, group, metric_type, Authorizations::parse_list(&auths)?);
            if let Some(name) = name {
                query = query.with_name(name);
            }
            if let Some(unit) = unit {
                query = query.with_unit(unit);
            }
            if by_group {
                query = query.by_group();
            }
            cmd_query(&config, query).await
        },
    }
}
