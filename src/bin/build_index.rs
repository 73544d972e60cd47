//! Index build binary entry point.
//!
//! Embeds every stored record (reusing cached embeddings), writes a new
//! snapshot generation and makes it current.
//!
//! ```bash
//! build-index
//! build-index --config paper-search.yaml --json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use paper_search::{
    app::SearchContext,
    config::ConfigLoader,
    logging::init_logging,
    storage::RecordStore,
};
use tracing::{info, warn};

/// Build the search index from the record store
#[derive(Parser, Debug)]
#[command(name = "build-index", version, about = "Build a new search index snapshot")]
struct Args {
    /// Configuration file (defaults to ./paper-search.yaml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Print the build report as JSON
    #[arg(long)]
    json: bool,

    /// Override the configured log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ConfigLoader::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    let ctx = SearchContext::open(config)
        .await
        .context("Failed to open search context")?;

    let records = ctx.store.count_records().await?;
    if records == 0 {
        warn!("Record store is empty; the snapshot will contain no vectors. Run ingest first.");
    }
    info!(records, "building index");

    let report = ctx.builder.build().await.context("Index build failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n╔════════════════════════════════════════╗");
    println!("║      Index Build Completed             ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Records seen:         {:>16} ║", report.records_seen);
    println!("║ Indexed:              {:>16} ║", report.indexed);
    println!("║ Failed to embed:      {:>16} ║", report.failed.len());
    println!("║ Cache hits:           {:>16} ║", report.cache_hits);
    println!("║ Recomputed:           {:>16} ║", report.recomputed);
    println!("║ Elapsed (ms):         {:>16} ║", report.elapsed_ms);
    println!("╚════════════════════════════════════════╝");
    println!("Generation: {}", report.generation);

    for id in &report.failed {
        println!("  not indexed: {}", id);
    }
    Ok(())
}
