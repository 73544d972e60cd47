//! Ingestion binary entry point.
//!
//! Pulls raw paper payloads from a feed file into the record store. Embeddings
//! are not computed here; run `build-index` afterwards.
//!
//! # Examples
//!
//! ```bash
//! ingest --input papers.json
//! ingest --input export.json --limit 500 --config paper-search.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paper_search::{
    app::open_record_store,
    config::{AppConfig, ConfigLoader},
    ingestion::{IngestionPipeline, RetryPolicy},
    logging::init_logging,
    provider::{json::JsonFileFeed, PaperFeed},
};
use tracing::{debug, info, warn};

/// Ingestion CLI for loading paper payloads into the record store
#[derive(Parser, Debug)]
#[command(
    name = "ingest",
    version,
    about = "Load paper payloads into the record store",
    long_about = "Reads a JSON feed export (an array of entries, or {\"feed\": {\"entry\": [...]}}), \
                  validates each entry and appends new records to the record store. \
                  Records whose id is already stored are skipped.

EXAMPLES:
  Load a feed export:
    ingest --input papers.json

  Load only the first 500 entries with debug logging:
    ingest --input papers.json --limit 500 --log-level debug"
)]
struct Args {
    /// Input JSON file containing raw feed entries
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Stop after this many entries
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Configuration file (defaults to ./paper-search.yaml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = ConfigLoader::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

/// Create a progress bar for tracking ingestion
fn create_progress_bar(total: Option<usize>) -> Result<ProgressBar> {
    let pb = match total {
        Some(total) => ProgressBar::new(total as u64),
        None => ProgressBar::new_spinner(),
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} entries | Inserted: {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );
    Ok(pb)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Starting paper ingestion");
    debug!("CLI arguments: {:?}", args);
    let start_time = Instant::now();

    if !args.input.exists() {
        anyhow::bail!("Input file not found: {:?}", args.input);
    }

    let store = open_record_store(&config)
        .await
        .with_context(|| format!("Failed to open record store at {:?}", config.records_db()))?;
    info!("Record store: {}", config.records_db().display());

    let feed = JsonFileFeed::from_file(&args.input)
        .await
        .with_context(|| format!("Failed to load feed from {:?}", args.input))?;

    let total = feed.count_records().await?;
    let expected = match (total, args.limit) {
        (Some(total), Some(limit)) => Some(total.min(limit)),
        (total, limit) => total.or(limit),
    };
    info!("Found {:?} entries in {}", total, feed.name());

    if expected == Some(0) {
        warn!("No entries found in input file");
        return Ok(());
    }

    let settings = &config.ingestion;
    let pipeline = IngestionPipeline::new(
        Arc::new(store),
        settings.feed_batch_size,
        RetryPolicy::new(settings.max_attempts, Duration::from_secs(settings.retry_delay_secs)),
    )
    .with_batch_pause(Duration::from_millis(settings.batch_pause_ms));

    let progress = create_progress_bar(expected)?;
    progress.set_message("0");

    let stats = pipeline
        .ingest_from_feed_with(&feed, args.limit, |stats| {
            progress.set_position(stats.total_processed as u64);
            progress.set_message(stats.inserted.to_string());
        })
        .await
        .context("Failed to ingest feed")?;

    progress.finish_with_message(stats.inserted.to_string());

    // Display final statistics
    let elapsed = start_time.elapsed();
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Ingestion Completed               ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Total processed:      {:>16} ║", stats.total_processed);
    println!("║ Inserted:             {:>16} ║", stats.inserted);
    println!("║ Duplicates skipped:   {:>16} ║", stats.duplicates_skipped);
    println!("║ Invalid entries:      {:>16} ║", stats.invalid);
    println!("║ Failed writes:        {:>16} ║", stats.failed);
    println!("║ Skipped batches:      {:>16} ║", stats.batches_skipped);
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");

    if stats.invalid + stats.failed > 0 {
        warn!(
            "{} entries were not stored - check logs for details",
            stats.invalid + stats.failed
        );
    }

    info!("Ingestion completed; run build-index to refresh the search index");
    Ok(())
}
